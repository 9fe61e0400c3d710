// src/core/control/client.rs

//! A client for Tor's control-port protocol: connect, authenticate,
//! subscribe to descriptor events, fetch and post descriptors, and request
//! a new circuit identity. Mirrors the connect/send/receive shape of a
//! typical control-plane client: short timeouts on both connect and each
//! round trip, one `Framed` stream carrying the codec.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::core::control::codec::{ControlCodec, Reply};
use crate::core::errors::OnionBalanceError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ControlClient {
    framed: Framed<TcpStream, ControlCodec>,
}

impl ControlClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, OnionBalanceError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| OnionBalanceError::ControlChannelUnreachable(format!("connect to {addr} timed out")))?
            .map_err(|e| OnionBalanceError::ControlChannelUnreachable(format!("{addr}: {e}")))?;

        Ok(Self {
            framed: Framed::new(stream, ControlCodec::default()),
        })
    }

    async fn command(&mut self, line: impl Into<String>) -> Result<Reply, OnionBalanceError> {
        let line = line.into();
        self.framed
            .send(line.clone())
            .await
            .map_err(|e| OnionBalanceError::ControlChannelLost(e.to_string()))?;

        timeout(COMMAND_TIMEOUT, self.framed.next())
            .await
            .map_err(|_| OnionBalanceError::ControlChannelLost(format!("no reply to {line:?} within timeout")))?
            .ok_or_else(|| OnionBalanceError::ControlChannelLost("control connection closed".into()))?
            .map_err(|e| OnionBalanceError::ControlChannelLost(e.to_string()))
    }

    /// Authenticates using a password, or the empty string if the control
    /// port has no authentication configured.
    pub async fn authenticate(&mut self, password: Option<&str>) -> Result<(), OnionBalanceError> {
        let quoted = password.unwrap_or("");
        let reply = self.command(format!("AUTHENTICATE \"{quoted}\"")).await?;
        if !reply.is_success() {
            return Err(OnionBalanceError::ControlAuthFailed(reply.first_line().to_string()));
        }
        Ok(())
    }

    /// Returns the running Tor version as reported by `GETVERSION`-shaped
    /// GETINFO output (`version`).
    pub async fn get_version(&mut self) -> Result<String, OnionBalanceError> {
        let reply = self.command("GETINFO version").await?;
        if !reply.is_success() {
            return Err(OnionBalanceError::ControlChannelLost(format!("GETINFO version failed: {}", reply.first_line())));
        }
        reply
            .lines
            .iter()
            .find_map(|l| l.strip_prefix("version="))
            .map(str::to_string)
            .ok_or_else(|| OnionBalanceError::ControlChannelLost("GETINFO version returned no value".into()))
    }

    /// Subscribes to the two descriptor-lifecycle event classes the
    /// manager reacts to.
    pub async fn subscribe_descriptor_events(&mut self) -> Result<(), OnionBalanceError> {
        let reply = self.command("SETEVENTS HS_DESC HS_DESC_CONTENT").await?;
        if !reply.is_success() {
            return Err(OnionBalanceError::ControlChannelLost(format!("SETEVENTS failed: {}", reply.first_line())));
        }
        Ok(())
    }

    /// Requests a new circuit identity (`SIGNAL NEWNYM`), used before
    /// re-fetching instance descriptors so stale circuits don't serve
    /// cached data.
    pub async fn signal_new_identity(&mut self) -> Result<(), OnionBalanceError> {
        let reply = self.command("SIGNAL NEWNYM").await?;
        if !reply.is_success() {
            warn!("SIGNAL NEWNYM failed: {}", reply.first_line());
        }
        Ok(())
    }

    /// Asks Tor to begin fetching `onion_address`'s descriptor; the result
    /// arrives later as an `HS_DESC`/`HS_DESC_CONTENT` event, not as a
    /// reply to this command.
    pub async fn fetch_descriptor(&mut self, onion_address: &str) -> Result<(), OnionBalanceError> {
        let reply = self.command(format!("HSFETCH {onion_address}")).await?;
        if !reply.is_success() {
            return Err(OnionBalanceError::ControlChannelLost(format!(
                "HSFETCH {onion_address} failed: {}",
                reply.first_line()
            )));
        }
        Ok(())
    }

    /// Posts a generated descriptor blob for publication.
    pub async fn post_descriptor(&mut self, descriptor: &[u8]) -> Result<(), OnionBalanceError> {
        let body = String::from_utf8_lossy(descriptor);
        let mut command = String::from("+HSPOST\r\n");
        for line in body.lines() {
            if let Some(stripped) = line.strip_prefix('.') {
                command.push('.');
                command.push_str(stripped);
            } else {
                command.push_str(line);
            }
            command.push_str("\r\n");
        }
        command.push('.');

        let reply = self.command(command).await?;
        if !reply.is_success() {
            return Err(OnionBalanceError::DescriptorPostFailed(reply.first_line().to_string()));
        }
        Ok(())
    }

    /// Waits for the next asynchronous event (a reply with status 650),
    /// returning `None` only once the connection has closed cleanly. Any
    /// non-event reply read here (there shouldn't be one, since `command`
    /// consumes its own reply) is logged and skipped rather than mistaken
    /// for a closed connection.
    pub async fn next_event(&mut self) -> Result<Option<Reply>, OnionBalanceError> {
        loop {
            match self.framed.next().await {
                None => return Ok(None),
                Some(Ok(reply)) if reply.is_async_event() => return Ok(Some(reply)),
                Some(Ok(reply)) => {
                    debug!("ignoring unexpected non-event reply: {:?}", reply);
                }
                Some(Err(e)) => return Err(OnionBalanceError::ControlChannelLost(e.to_string())),
            }
        }
    }
}
