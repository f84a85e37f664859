//! # Frame Sets on a Byte Stream
//!
//! A frame set is written segment by segment as
//! `[more: u8][len: u32 BE][bytes: len]`, where `more = 0` marks the last segment.
//!
//! The WebSocket bridge uses the same continuation flag, but with one segment per
//! WebSocket frame and no length (the WebSocket frame already delimits it):
//! `[more: u8][bytes]`.
//!
//! ## Invariants
//! - **Non-Empty**: A frame set has at least one segment; an empty one cannot be
//!   terminated and is rejected on write.
//! - **Bounded**: Segments longer than [`MAX_SEGMENT_LEN`] are rejected before any
//!   allocation, so a corrupt length cannot exhaust memory.

use crate::error::Error;
use crate::error::Result;
use crate::message::FrameSet;

/// Largest accepted segment.
pub const MAX_SEGMENT_LEN: usize = 1 << 30;

const FLAG_MORE: u8 = 1;
const FLAG_LAST: u8 = 0;
const HEADER_LEN: usize = 5;

/// Serializes one frame set onto the end of `out`.
pub fn write_frame_set(frames: &[Vec<u8>], out: &mut Vec<u8>) -> Result<()> {
    if frames.is_empty() {
        return Err(Error::Framing("empty frame set".into()));
    }
    let last = frames.len() - 1;
    for (i, seg) in frames.iter().enumerate() {
        if seg.len() > MAX_SEGMENT_LEN {
            return Err(Error::Framing(format!("segment of {} bytes is too large", seg.len())));
        }
        out.push(if i == last { FLAG_LAST } else { FLAG_MORE });
        out.extend_from_slice(&(seg.len() as u32).to_be_bytes());
        out.extend_from_slice(seg);
    }
    Ok(())
}

/// Serializes one frame set into a fresh buffer.
pub fn encode_frame_set(frames: &[Vec<u8>]) -> Result<Vec<u8>> {
    let size = frames.iter().map(|s| s.len() + HEADER_LEN).sum();
    let mut out = Vec::with_capacity(size);
    write_frame_set(frames, &mut out)?;
    Ok(out)
}

/// Reassembles frame sets from a byte stream delivered in arbitrary chunks.
#[derive(Debug, Default)]
pub struct FrameSetDecoder {
    buf: Vec<u8>,
    pending: FrameSet,
}

impl FrameSetDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete frame set, or `Ok(None)` if more bytes are needed.
    ///
    /// # Errors
    /// A segment length above [`MAX_SEGMENT_LEN`] or an unknown flag byte. The
    /// stream cannot be resynchronised after that; callers drop the connection.
    pub fn next_frame_set(&mut self) -> Result<Option<FrameSet>> {
        let mut pos = 0;
        let result = loop {
            let Some(header) = self.buf.get(pos..pos + HEADER_LEN) else {
                break None;
            };
            let flag = header[0];
            if flag != FLAG_MORE && flag != FLAG_LAST {
                return Err(Error::Framing(format!("bad continuation flag {:#04x}", flag)));
            }
            let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
            if len > MAX_SEGMENT_LEN {
                return Err(Error::Framing(format!("segment of {} bytes is too large", len)));
            }
            let start = pos + HEADER_LEN;
            let Some(seg) = self.buf.get(start..start + len) else {
                break None;
            };
            self.pending.push(seg.to_vec());
            pos = start + len;
            if flag == FLAG_LAST {
                break Some(std::mem::take(&mut self.pending));
            }
        };
        self.buf.drain(..pos);
        Ok(result)
    }
}

/// Splits a frame set into WebSocket payloads, one per segment, each prefixed
/// with its continuation flag.
pub fn split_for_websocket(frames: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let last = frames.len().saturating_sub(1);
    frames
        .iter()
        .enumerate()
        .map(|(i, seg)| {
            let mut out = Vec::with_capacity(seg.len() + 1);
            out.push(if i == last { FLAG_LAST } else { FLAG_MORE });
            out.extend_from_slice(seg);
            out
        })
        .collect()
}

/// Accumulates flagged WebSocket payloads into frame sets.
#[derive(Debug, Default)]
pub struct WebSocketAssembler {
    pending: FrameSet,
}

impl WebSocketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one WebSocket payload; returns the frame set it completes, if any.
    pub fn push(&mut self, payload: &[u8]) -> Result<Option<FrameSet>> {
        let (&flag, seg) = payload
            .split_first()
            .ok_or_else(|| Error::Framing("empty websocket frame".into()))?;
        self.pending.push(seg.to_vec());
        match flag {
            FLAG_LAST => Ok(Some(std::mem::take(&mut self.pending))),
            _ => Ok(None),
        }
    }
}
