// src/core/descriptor/key.rs

//! Service key loading and onion-address derivation.
//!
//! A service is identified by an RSA-2048 key pair; the onion address is the
//! base32 encoding of the first 10 bytes of the SHA-1 digest of the
//! PKCS#1-DER-encoded public key, per spec.md's Data Model section.

use data_encoding::BASE32_NOPAD;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use std::path::Path;

use crate::core::errors::OnionBalanceError;

/// An RSA-2048 long-term service key, paired with the onion address it
/// derives.
#[derive(Clone)]
pub struct ServiceKey {
    pub private_key: RsaPrivateKey,
    pub public_key: RsaPublicKey,
    pub onion_address: String,
}

impl ServiceKey {
    /// Loads a PEM-encoded RSA private key, accepting either PKCS#1 or
    /// PKCS#8 framing since both appear in the wild for Tor service keys.
    pub fn load_from_pem_file(path: &Path) -> Result<Self, OnionBalanceError> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            OnionBalanceError::ConfigInvalid(format!("failed to read key file {}: {e}", path.display()))
        })?;
        Self::from_pem(&pem)
    }

    pub fn from_pem(pem: &str) -> Result<Self, OnionBalanceError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem).or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))?;
        Self::from_private_key(private_key)
    }

    pub fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, OnionBalanceError> {
        let public_key = RsaPublicKey::from(&private_key);
        let onion_address = onion_address_from_public_key(&public_key)?;
        Ok(Self {
            private_key,
            public_key,
            onion_address,
        })
    }
}

/// Derives the 16-character onion address for `pubkey`: the lowercase
/// base32 encoding of the first 10 bytes of `SHA1(DER(pubkey))`.
pub fn onion_address_from_public_key(pubkey: &RsaPublicKey) -> Result<String, OnionBalanceError> {
    let der = pubkey
        .to_pkcs1_der()
        .map_err(|e| OnionBalanceError::ConfigInvalid(format!("failed to DER-encode RSA public key: {e}")))?;
    let digest = Sha1::digest(der.as_bytes());
    let truncated = &digest[..10];
    Ok(BASE32_NOPAD.encode(truncated).to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn onion_address_is_16_chars_of_lowercase_base32() {
        let key = RsaPrivateKey::new(&mut OsRng, 2048).expect("key generation");
        let service_key = ServiceKey::from_private_key(key).expect("derive onion address");
        assert_eq!(service_key.onion_address.len(), 16);
        assert!(service_key.onion_address.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn same_key_derives_same_address_deterministically() {
        let key = RsaPrivateKey::new(&mut OsRng, 2048).expect("key generation");
        let public_key = RsaPublicKey::from(&key);
        let a = onion_address_from_public_key(&public_key).unwrap();
        let b = onion_address_from_public_key(&public_key).unwrap();
        assert_eq!(a, b);
    }
}
