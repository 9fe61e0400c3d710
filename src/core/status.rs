// src/core/status.rs

//! The status socket: a passive, read-only snapshot of the current model,
//! written once per accepted connection then the connection is closed.
//!
//! Grounded on the accept-loop shape of a typical control-plane listener,
//! but bound to a Unix-domain socket instead of TCP, and with a bounded
//! accept so it can be interleaved with the scheduler tick rather than
//! blocking the single-threaded core indefinitely.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::warn;

use crate::core::service::Service;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct StatusServer {
    listener: UnixListener,
    path: PathBuf,
}

impl StatusServer {
    pub fn bind(path: &Path) -> std::io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        Ok(Self { listener, path: path.to_path_buf() })
    }

    /// Accepts at most one connection, waiting no longer than `timeout`;
    /// returns `Ok(None)` on timeout so the caller's scheduler tick is not
    /// blocked indefinitely.
    pub async fn try_accept(&self, timeout: Duration) -> std::io::Result<Option<UnixStream>> {
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(Ok((stream, _addr))) => Ok(Some(stream)),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Writes the current snapshot to `stream` and closes it.
    pub async fn serve_snapshot(stream: &mut UnixStream, services: &[Service]) -> std::io::Result<()> {
        let snapshot = render_snapshot(services);
        stream.write_all(snapshot.as_bytes()).await?;
        stream.shutdown().await
    }
}

impl Drop for StatusServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("failed to remove status socket at {}: {}", self.path.display(), e);
        }
    }
}

/// Renders the full snapshot grammar: one block per service, each instance
/// on its own pair of `published:`/`health:` lines, blocks separated by a
/// blank line.
pub fn render_snapshot(services: &[Service]) -> String {
    let mut out = String::new();
    for service in services {
        let uploaded = service
            .uploaded
            .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_else(|| "None".to_string());
        out.push_str(&format!("{}.onion {}\n", service.onion_address(), uploaded));

        for instance in &service.instances {
            out.push_str(&format!("  {}.onion\n", instance.onion_address));
            match instance.timestamp {
                Some(ts) => {
                    out.push_str(&format!(
                        "    published:   {} {} ips\n",
                        ts.format(TIMESTAMP_FORMAT),
                        instance.introduction_points.len()
                    ));
                }
                None => out.push_str("    published:   [not published]\n"),
            }
            if instance.is_healthy() {
                out.push_str("    health:      [ up ]\n");
            } else {
                out.push_str("    health:      [down]\n");
            }
        }
        out.push('\n');
    }
    out
}
