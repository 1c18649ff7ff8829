//! Splits the upstream byte stream into image payloads.

use bytes::{Buf, Bytes, BytesMut};
use serde::Deserialize;
use thiserror::Error;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// JPEG images delimited by their SOI/EOI markers.
    Mjpeg,
    /// Big-endian u32 length followed by a JPEG payload.
    LengthPrefixed,
    /// Fixed-size raw BGR frames.
    RawBgr24,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Jpeg(Bytes),
    RawBgr { width: u32, height: u32, data: Bytes },
}

#[derive(Error, Debug, PartialEq)]
pub enum FramingError {
    /// The current payload was discarded; decoding can continue.
    #[error("corrupt payload: {0}")]
    Corrupt(String),
    /// Payload boundaries can no longer be trusted; buffered bytes were dropped.
    #[error("framing lost: {0}")]
    LostSync(String),
}

pub struct FrameDecoder {
    framing: Framing,
    max_payload_bytes: usize,
    raw_size: (u32, u32),
    buffer: BytesMut,
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|p| p + from)
}

impl FrameDecoder {
    pub fn new(framing: Framing, max_payload_bytes: usize, raw_size: (u32, u32)) -> Self {
        Self {
            framing,
            max_payload_bytes,
            raw_size,
            buffer: BytesMut::with_capacity(64 * 1024),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Forget partial data, for instance after a reconnect.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Next complete payload, `Ok(None)` when more bytes are needed.
    pub fn decode(&mut self) -> Result<Option<Payload>, FramingError> {
        match self.framing {
            Framing::Mjpeg => self.decode_mjpeg(),
            Framing::LengthPrefixed => self.decode_length_prefixed(),
            Framing::RawBgr24 => Ok(self.decode_raw()),
        }
    }

    fn decode_mjpeg(&mut self) -> Result<Option<Payload>, FramingError> {
        let Some(start) = find(&self.buffer, &SOI, 0) else {
            // Keep a trailing 0xFF, it may begin the next marker.
            let keep = usize::from(self.buffer.last() == Some(&0xFF));
            let discard = self.buffer.len() - keep;
            self.buffer.advance(discard);
            return Ok(None);
        };
        self.buffer.advance(start);

        let next_start = find(&self.buffer, &SOI, 2);
        let end = find(&self.buffer, &EOI, 2);
        match (end, next_start) {
            (Some(end), next) if next.map_or(true, |n| end < n) => {
                let len = end + 2;
                let payload = self.buffer.split_to(len).freeze();
                if len > self.max_payload_bytes {
                    return Err(FramingError::Corrupt(format!(
                        "payload of {len} bytes exceeds limit of {}",
                        self.max_payload_bytes
                    )));
                }
                Ok(Some(Payload::Jpeg(payload)))
            }
            (_, Some(next)) => {
                self.buffer.advance(next);
                Err(FramingError::Corrupt(format!(
                    "truncated image of {next} bytes"
                )))
            }
            _ if self.buffer.len() > self.max_payload_bytes => {
                let dropped = self.buffer.len();
                self.buffer.clear();
                Err(FramingError::Corrupt(format!(
                    "unterminated image exceeds limit ({dropped} bytes buffered)"
                )))
            }
            _ => Ok(None),
        }
    }

    fn decode_length_prefixed(&mut self) -> Result<Option<Payload>, FramingError> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if len == 0 || len > self.max_payload_bytes {
            self.buffer.clear();
            return Err(FramingError::LostSync(format!(
                "length prefix {len} outside 1..={}",
                self.max_payload_bytes
            )));
        }
        if self.buffer.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }
        self.buffer.advance(LENGTH_PREFIX);
        let payload = self.buffer.split_to(len).freeze();
        Ok(Some(Payload::Jpeg(payload)))
    }

    fn decode_raw(&mut self) -> Option<Payload> {
        let (width, height) = self.raw_size;
        let len = width as usize * height as usize * 3;
        if len == 0 || self.buffer.len() < len {
            return None;
        }
        let data = self.buffer.split_to(len).freeze();
        Some(Payload::RawBgr {
            width,
            height,
            data,
        })
    }
}
