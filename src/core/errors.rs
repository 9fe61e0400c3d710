// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the manager.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum OnionBalanceError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("cannot reach Tor control port: {0}")]
    ControlChannelUnreachable(String),

    #[error("Tor control authentication failed: {0}")]
    ControlAuthFailed(String),

    #[error("Tor control port version is too old, need >= {required}, got {actual}")]
    ControlVersionTooOld { required: String, actual: String },

    #[error("Tor control channel connection lost: {0}")]
    ControlChannelLost(String),

    #[error("malformed descriptor: {0}")]
    DescriptorMalformed(String),

    #[error("stale descriptor rejected (published_at not newer than current)")]
    DescriptorStale,

    #[error("descriptor decryption failed: {0}")]
    DescriptorDecryptionFailed(String),

    #[error("descriptor generation failed: {0}")]
    DescriptorGenerationFailed(String),

    #[error("descriptor post failed: {0}")]
    DescriptorPostFailed(String),

    #[error("health probe failed: {0}")]
    ProbeFailed(String),

    #[error("status socket error: {0}")]
    StatusSocketError(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<std::io::Error> for OnionBalanceError {
    fn from(e: std::io::Error) -> Self {
        OnionBalanceError::Io(Arc::new(e))
    }
}

impl From<toml::de::Error> for OnionBalanceError {
    fn from(e: toml::de::Error) -> Self {
        OnionBalanceError::ConfigInvalid(e.to_string())
    }
}

impl From<rsa::Error> for OnionBalanceError {
    fn from(e: rsa::Error) -> Self {
        OnionBalanceError::DescriptorGenerationFailed(e.to_string())
    }
}

impl From<rsa::pkcs8::Error> for OnionBalanceError {
    fn from(e: rsa::pkcs8::Error) -> Self {
        OnionBalanceError::ConfigInvalid(format!("failed to load RSA key: {e}"))
    }
}

impl From<rsa::pkcs1::Error> for OnionBalanceError {
    fn from(e: rsa::pkcs1::Error) -> Self {
        OnionBalanceError::ConfigInvalid(format!("failed to load RSA key: {e}"))
    }
}
