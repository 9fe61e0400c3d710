// src/core/control/mod.rs

//! Tor control-port protocol: wire codec, client, and descriptor-event
//! handling.

pub mod client;
pub mod codec;
pub mod event;

pub use client::ControlClient;
pub use codec::{ControlCodec, Reply};
pub use event::DescriptorEvent;
