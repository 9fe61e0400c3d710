// src/core/control/event.rs

//! Parsing of the two asynchronous event classes the manager subscribes to,
//! and the handler that applies them to instance state.

use tracing::{debug, warn};

use crate::core::control::codec::Reply;
use crate::core::descriptor;
use crate::core::errors::OnionBalanceError;
use crate::core::instance::Instance;

/// A descriptor-lifecycle notification delivered asynchronously over the
/// control channel.
#[derive(Debug, Clone)]
pub enum DescriptorEvent {
    /// `HS_DESC`: a descriptor fetch reached a terminal state. Only the
    /// `RECEIVED` action carries data worth acting on; other actions
    /// (`FAILED`, `UPLOADED`, ...) are logged and otherwise ignored.
    StateChange { onion_address: String, action: String },
    /// `HS_DESC_CONTENT`: the body of a just-received descriptor.
    Content { onion_address: String, body: Vec<u8> },
}

/// Parses one `650` reply into a [`DescriptorEvent`], returning `None` for
/// event classes the manager did not subscribe to (defensive: Tor should
/// never send these given the `SETEVENTS` filter actually requested, but a
/// stray line should not be fatal).
pub fn parse(reply: &Reply) -> Option<DescriptorEvent> {
    let first = reply.first_line();
    let mut parts = first.split_whitespace();
    let kind = parts.next()?;

    match kind {
        "HS_DESC" => {
            let action = parts.next()?.to_string();
            let onion_address = parts.next()?.trim_end_matches(".onion").to_string();
            Some(DescriptorEvent::StateChange { onion_address, action })
        }
        "HS_DESC_CONTENT" => {
            let onion_address = parts.next()?.trim_end_matches(".onion").to_string();
            // `reply.lines` is `[header, ...data lines, terminating status
            // line's text]` (e.g. "OK"); the last element is not part of
            // the descriptor body.
            let data_lines = &reply.lines[1..];
            let body_lines = data_lines.split_last().map(|(_, rest)| rest).unwrap_or(&[]);
            let body = body_lines.join("\n").into_bytes();
            Some(DescriptorEvent::Content { onion_address, body })
        }
        _ => None,
    }
}

/// Applies a descriptor event to the matching instance, if any service
/// tracks that onion address. Idempotent: a duplicate `Content` delivery
/// for an already-current descriptor is rejected by [`Instance::update`]'s
/// own staleness check rather than by anything here.
pub fn apply(event: DescriptorEvent, instances: &mut [&mut Instance]) -> Result<(), OnionBalanceError> {
    match event {
        DescriptorEvent::StateChange { onion_address, action } => {
            debug!(%onion_address, %action, "descriptor state change");
            Ok(())
        }
        DescriptorEvent::Content { onion_address, body } => {
            let Some(instance) = instances.iter_mut().find(|i| i.onion_address == onion_address) else {
                warn!(%onion_address, "descriptor content for an instance this manager does not track");
                return Ok(());
            };

            let parsed = descriptor::parse(&body)?;
            match instance.update(parsed) {
                Ok(_) => Ok(()),
                Err(OnionBalanceError::DescriptorStale) => {
                    debug!(%onion_address, "ignoring stale descriptor content");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
    }
}
