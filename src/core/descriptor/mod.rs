// src/core/descriptor/mod.rs

//! Hidden-service descriptor key handling and wire codec.

pub mod codec;
pub mod key;

pub use codec::{Descriptor, choose, encrypt_introduction_point, generate, parse, verify};
pub use key::{ServiceKey, onion_address_from_public_key};
