// src/core/control/codec.rs

//! A `tokio_util::codec` `Decoder`/`Encoder` pair for Tor's control-port
//! protocol: CRLF-terminated lines, multi-line replies joined by a `-`
//! separator after the status code, and a final line using a space
//! separator; `+` introduces a data reply terminated by a lone `.` line
//! (with leading dots on data lines escaped by doubling, "dot-stuffing",
//! which this codec undoes on decode and redoes on encode).

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// One complete control-port reply: a status code and its constituent
/// lines (continuation lines' leading `code-`/`code+` markers stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_async_event(&self) -> bool {
        self.code == 650
    }

    pub fn first_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct ControlCodec {
    in_progress: Option<Reply>,
    reading_data: bool,
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

impl Decoder for ControlCodec {
    type Item = Reply;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = find_crlf(src) else { return Ok(None) };
            let line = src.split_to(pos).to_vec();
            src.advance(2);
            let line = String::from_utf8(line)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

            if self.reading_data {
                if line == "." {
                    self.reading_data = false;
                    continue;
                }
                let unstuffed = line.strip_prefix('.').map(str::to_string).unwrap_or(line);
                if let Some(reply) = self.in_progress.as_mut() {
                    reply.lines.push(unstuffed);
                }
                continue;
            }

            if line.len() < 4 {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, format!("malformed control line: {line:?}")));
            }
            let (code_str, rest) = line.split_at(3);
            let code: u16 = code_str
                .parse()
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("bad status code: {code_str}")))?;
            let separator = rest.chars().next().unwrap_or(' ');
            let text = rest[1..].to_string();

            let reply = self.in_progress.get_or_insert_with(|| Reply { code, lines: Vec::new() });
            reply.lines.push(text);

            match separator {
                '-' => continue,
                '+' => {
                    self.reading_data = true;
                    continue;
                }
                _ => return Ok(self.in_progress.take()),
            }
        }
    }
}

impl Encoder<String> for ControlCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_bytes());
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}
