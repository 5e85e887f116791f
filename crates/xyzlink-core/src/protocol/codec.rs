//! Line decoding for the inbound serial stream
//!
//! Firmware output is mostly ASCII but occasionally carries stray bytes, `\r\n`
//! endings, and blank keep-alive lines. The decoder never fails on content: it
//! decodes lossily, trims, and drops empty lines. Overlong lines are cut at
//! `max_length` and the remainder up to the next newline is discarded.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use super::ProtocolError;

/// Tolerant newline-delimited text decoder
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    /// Skipping the tail of an overlong line
    discarding: bool,
}

impl LineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            discarding: false,
        }
    }

    fn clean(raw: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        loop {
            let newline = src.iter().position(|b| *b == b'\n');

            match newline {
                Some(pos) => {
                    let line = src.split_to(pos + 1);
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    let end = if pos > self.max_length {
                        tracing::warn!("inbound line exceeds {} bytes, truncating", self.max_length);
                        self.max_length
                    } else {
                        pos
                    };
                    if let Some(text) = Self::clean(&line[..end]) {
                        return Ok(Some(text));
                    }
                }
                None if src.len() > self.max_length => {
                    let head = src.split_to(self.max_length);
                    if self.discarding {
                        continue;
                    }
                    self.discarding = true;
                    tracing::warn!("inbound line exceeds {} bytes, truncating", self.max_length);
                    if let Some(text) = Self::clean(&head) {
                        return Ok(Some(text));
                    }
                }
                None => {
                    if self.discarding {
                        src.advance(src.len());
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        let rest = src.split_to(src.len());
        if std::mem::take(&mut self.discarding) {
            return Ok(None);
        }
        Ok(Self::clean(&rest))
    }
}
