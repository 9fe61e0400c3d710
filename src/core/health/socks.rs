// src/core/health/socks.rs

//! A minimal SOCKS5 `CONNECT` handshake, used only for the raw-TCP health
//! probe. Per spec.md §9 ("Monkey-patching of socket resolution ... must be
//! replaced by explicit per-connection proxy dialers"), this dials the proxy
//! itself on every call rather than rebinding global socket resolution.

use anyhow::{Result, anyhow, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Performs a SOCKS5 `CONNECT` to `host:port` over an already-established
/// connection to the proxy. Returns the stream, now positioned to relay
/// application data to the target, on success.
pub async fn connect(mut stream: TcpStream, host: &str, port: u16) -> Result<TcpStream> {
    if host.len() > u8::MAX as usize {
        bail!("destination hostname too long for SOCKS5");
    }

    // Greeting: version 5, one method offered, "no authentication".
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x05 {
        bail!("proxy is not speaking SOCKS5");
    }
    if reply[1] != 0x00 {
        bail!("proxy rejected all authentication methods (got {})", reply[1]);
    }

    // CONNECT request, domain-name address type.
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host.len() as u8]);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != 0x05 {
        bail!("malformed SOCKS5 reply");
    }
    if head[1] != 0x00 {
        bail!("SOCKS5 CONNECT failed with reply code {}", head[1]);
    }

    // Drain the bound-address field so the stream is left clean; its
    // length depends on the address type echoed back.
    match head[3] {
        0x01 => {
            let mut rest = [0u8; 4 + 2];
            stream.read_exact(&mut rest).await?;
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await?;
        }
        0x04 => {
            let mut rest = [0u8; 16 + 2];
            stream.read_exact(&mut rest).await?;
        }
        other => return Err(anyhow!("unknown SOCKS5 address type {}", other)),
    }

    Ok(stream)
}
