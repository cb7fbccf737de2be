// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Length-prefixed framing.
//!
//! ```text
//! offset 0   4 bytes  format tag "ddpm"
//! offset 4   4 bytes  format version (u32 LE)
//! offset 8   4 bytes  payload size N (u32 LE)
//! offset 12  N bytes  MessagePack document
//! ```

use crate::errors::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub const FORMAT_TAG: [u8; 4] = *b"ddpm";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 8;
pub const SIZE_FIELD: usize = 4;
pub const PREFIX_SIZE: usize = HEADER_SIZE + SIZE_FIELD;
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Serialize `message` as one complete frame.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(message)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::FrameTooLarge {
            size: payload.len(),
            limit: MAX_PAYLOAD_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&FORMAT_TAG);
    frame.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode the payload of one complete frame (as returned by
/// [`FrameBuffer::next_frame`]).
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    let payload = frame.get(PREFIX_SIZE..).ok_or_else(|| Error::BadFrameHeader {
        context: format!("frame of {} bytes has no payload", frame.len()),
    })?;
    Ok(rmp_serde::from_slice(payload)?)
}

/// Accumulates bytes from a stream and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed as a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Remove and return the next complete frame, header included.
    ///
    /// Returns `Ok(None)` while fewer than 12 bytes, or fewer than the
    /// declared frame length, are buffered.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(prefix) = self.buf.get(..PREFIX_SIZE) else {
            return Ok(None);
        };

        if prefix[..4] != FORMAT_TAG {
            return Err(Error::BadFrameHeader {
                context: format!("unexpected format tag {:?}", &prefix[..4]),
            });
        }
        let version = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
        if version != FORMAT_VERSION {
            return Err(Error::BadFrameHeader {
                context: format!("unsupported format version {version}"),
            });
        }
        let size = u32::from_le_bytes([prefix[8], prefix[9], prefix[10], prefix[11]]) as usize;
        if size > MAX_PAYLOAD_SIZE {
            return Err(Error::FrameTooLarge {
                size,
                limit: MAX_PAYLOAD_SIZE,
            });
        }

        let total = PREFIX_SIZE + size;
        if self.buf.len() < total {
            return Ok(None);
        }
        let rest = self.buf.split_off(total);
        Ok(Some(std::mem::replace(&mut self.buf, rest)))
    }

    /// Drop everything buffered, used after a header error.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
