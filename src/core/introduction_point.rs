// src/core/introduction_point.rs

//! An introduction point as published inside a hidden-service descriptor.
//!
//! The manager treats the body of an introduction point as opaque: it never
//! inspects the link specifiers or the onion key, only the `identifier`
//! (the fingerprint of the per-circuit service key), which is what decides
//! whether an instance's introduction-point set has changed.

use bytes::Bytes;

/// One introduction point record, as decrypted from an instance's descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroductionPoint {
    /// Fingerprint of the per-circuit service key. Used to detect set changes
    /// and to deduplicate during aggregation.
    pub identifier: String,
    /// The raw, still-encoded body of this introduction point as it appeared
    /// in the instance's descriptor. Opaque to the manager; copied verbatim
    /// into the aggregate descriptor.
    pub raw: Bytes,
}

impl IntroductionPoint {
    pub fn new(identifier: impl Into<String>, raw: impl Into<Bytes>) -> Self {
        Self {
            identifier: identifier.into(),
            raw: raw.into(),
        }
    }
}
