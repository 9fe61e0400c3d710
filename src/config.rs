// src/config.rs

//! Configuration loading and validation.
//!
//! Follows the reference implementation's own shape: a `RawConfig` mirrors
//! the TOML file field-for-field, `Config::from_file` reads and parses it,
//! and `validate()` checks cross-field invariants the type system alone
//! can't express (e.g. a PEM file must actually exist and parse as an RSA
//! key) before the daemon starts acting on it.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::descriptor::ServiceKey;
use crate::core::errors::OnionBalanceError;
use crate::core::health::{HealthCheck, HealthCheckConfigEntry};
use crate::core::instance::Instance;
use crate::core::service::{SelectionMode, Service};

fn default_replicas() -> usize {
    2
}
fn default_max_intro_points() -> usize {
    10
}
fn default_validity_period() -> Duration {
    Duration::from_secs(86400)
}
fn default_overlap_period() -> Duration {
    Duration::from_secs(3600)
}
fn default_upload_period() -> Duration {
    Duration::from_secs(3600)
}
fn default_refresh_interval() -> Duration {
    Duration::from_secs(600)
}
fn default_publish_check_interval() -> Duration {
    Duration::from_secs(300)
}
fn default_initial_stagger() -> Duration {
    Duration::from_secs(30)
}
fn default_tor_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}
fn default_tor_control_port() -> u16 {
    9051
}
fn default_tor_socks_port() -> u16 {
    9050
}
fn default_status_socket_location() -> PathBuf {
    PathBuf::from("/var/run/onionbalance/control")
}
fn default_mode() -> SelectionMode {
    SelectionMode::RoundRobin
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_replicas")]
    replicas: usize,
    #[serde(default = "default_max_intro_points")]
    max_intro_points: usize,
    #[serde(default = "default_validity_period", with = "humantime_serde")]
    descriptor_validity_period: Duration,
    #[serde(default = "default_overlap_period", with = "humantime_serde")]
    descriptor_overlap_period: Duration,
    #[serde(default = "default_upload_period", with = "humantime_serde")]
    descriptor_upload_period: Duration,
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    refresh_interval: Duration,
    #[serde(default = "default_publish_check_interval", with = "humantime_serde")]
    publish_check_interval: Duration,
    #[serde(default = "default_initial_stagger", with = "humantime_serde")]
    initial_stagger: Duration,
    #[serde(default = "default_tor_address")]
    tor_address: IpAddr,
    #[serde(default = "default_tor_control_port")]
    tor_control_port: u16,
    #[serde(default = "default_tor_socks_port")]
    tor_socks_port: u16,
    tor_control_password: Option<String>,
    #[serde(default = "default_status_socket_location")]
    status_socket_location: PathBuf,
    services: Vec<RawServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServiceConfig {
    key: PathBuf,
    instances: Vec<RawInstanceConfig>,
    health_check: Option<HealthCheckConfigEntry>,
    #[serde(default = "default_mode")]
    mode: SelectionMode,
}

#[derive(Debug, Deserialize)]
struct RawInstanceConfig {
    address: String,
    /// Hex-encoded 16-byte authentication cookie, required only for
    /// instances whose descriptors are published with `basic auth`.
    auth_cookie: Option<String>,
}

pub struct Config {
    pub replicas: usize,
    pub max_intro_points: usize,
    pub descriptor_validity_period: Duration,
    pub descriptor_overlap_period: Duration,
    pub descriptor_upload_period: Duration,
    pub refresh_interval: Duration,
    pub publish_check_interval: Duration,
    pub initial_stagger: Duration,
    pub tor_address: IpAddr,
    pub tor_control_port: u16,
    pub tor_socks_port: u16,
    pub tor_control_password: Option<String>,
    pub status_socket_location: PathBuf,
    service_specs: Vec<RawServiceConfig>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, OnionBalanceError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| OnionBalanceError::ConfigInvalid(format!("failed to read {}: {e}", path.display())))?;
        let raw: RawConfig = toml::from_str(&text)?;
        let config = Self {
            replicas: raw.replicas,
            max_intro_points: raw.max_intro_points,
            descriptor_validity_period: raw.descriptor_validity_period,
            descriptor_overlap_period: raw.descriptor_overlap_period,
            descriptor_upload_period: raw.descriptor_upload_period,
            refresh_interval: raw.refresh_interval,
            publish_check_interval: raw.publish_check_interval,
            initial_stagger: raw.initial_stagger,
            tor_address: raw.tor_address,
            tor_control_port: raw.tor_control_port,
            tor_socks_port: raw.tor_socks_port,
            tor_control_password: raw.tor_control_password,
            status_socket_location: raw.status_socket_location,
            service_specs: raw.services,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), OnionBalanceError> {
        if self.service_specs.is_empty() {
            return Err(OnionBalanceError::ConfigInvalid("config must declare at least one service".into()));
        }
        if self.replicas == 0 {
            return Err(OnionBalanceError::ConfigInvalid("replicas must be >= 1".into()));
        }
        for spec in &self.service_specs {
            if spec.instances.is_empty() {
                return Err(OnionBalanceError::ConfigInvalid(format!(
                    "service {} declares no instances",
                    spec.key.display()
                )));
            }
            for instance in &spec.instances {
                if let Some(cookie) = &instance.auth_cookie {
                    parse_auth_cookie(cookie)?;
                }
            }
        }
        Ok(())
    }

    pub fn control_address(&self) -> SocketAddr {
        SocketAddr::new(self.tor_address, self.tor_control_port)
    }

    pub fn tor_socks_address(&self) -> SocketAddr {
        SocketAddr::new(self.tor_address, self.tor_socks_port)
    }

    /// Materializes the loaded service specs into live `Service` values,
    /// each with its RSA key loaded from disk and one empty `Instance` per
    /// configured back-end address.
    pub fn build_services(&self) -> Result<Vec<Service>, OnionBalanceError> {
        self.service_specs
            .iter()
            .map(|spec| {
                let service_key = ServiceKey::load_from_pem_file(&spec.key)?;
                let instances = spec
                    .instances
                    .iter()
                    .map(|i| {
                        let mut instance = Instance::new(i.address.clone());
                        if let Some(cookie) = &i.auth_cookie {
                            instance.auth_cookie = Some(parse_auth_cookie(cookie)?);
                        }
                        Ok(instance)
                    })
                    .collect::<Result<Vec<_>, OnionBalanceError>>()?;
                let health_check: HealthCheck = spec.health_check.clone().map(Into::into).unwrap_or(HealthCheck::None);
                Ok(Service::new(service_key, instances, health_check, spec.mode))
            })
            .collect()
    }
}

/// Decodes a hex-encoded authentication cookie, requiring exactly 16 bytes.
fn parse_auth_cookie(hex_str: &str) -> Result<[u8; 16], OnionBalanceError> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| OnionBalanceError::ConfigInvalid(format!("invalid auth_cookie hex encoding: {e}")))?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| OnionBalanceError::ConfigInvalid(format!("auth_cookie must be 16 bytes, got {}", bytes.len())))
}
