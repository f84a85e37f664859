//! Resumable stream decoding.

use crate::{Decoder, Error, Result, Value};

/// Splits a byte stream into values as bytes arrive.
///
/// Values are written back to back with no length prefix; the format's own
/// markers decide where one ends. Feed chunks of any size with [`feed`] and
/// pull complete values with [`next_value`].
///
/// After an incomplete attempt the unpacker remembers how long the buffer must
/// grow before decoding can succeed, and does not retry until it has.
///
/// [`feed`]: Unpacker::feed
/// [`next_value`]: Unpacker::next_value
#[derive(Debug, Default)]
pub struct Unpacker {
    buf: Vec<u8>,
    needed: usize,
}

impl Unpacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Bytes known to be missing from the value at the front of the buffer.
    pub fn missing(&self) -> usize {
        self.needed.saturating_sub(self.buf.len())
    }

    /// Extracts the next complete value.
    ///
    /// `Ok(None)` means the buffer holds only a prefix of a value; nothing is
    /// consumed and the caller should feed more bytes. On a hard error the
    /// buffer is cleared, so the error is reported once.
    pub fn next_value(&mut self) -> Result<Option<Value>> {
        if self.buf.is_empty() || self.buf.len() < self.needed {
            return Ok(None);
        }
        let mut dec = Decoder::new(&self.buf);
        match dec.value() {
            Ok(value) => {
                let used = self.buf.len() - dec.remaining();
                self.buf.drain(..used);
                self.needed = 0;
                Ok(Some(value))
            }
            Err(Error::UnexpectedEnd) => {
                self.needed = self.buf.len() + dec.missing().max(1);
                Ok(None)
            }
            Err(e) => {
                self.buf.clear();
                self.needed = 0;
                Err(e)
            }
        }
    }
}

/// Drains every complete value currently buffered.
impl Iterator for Unpacker {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_value().transpose()
    }
}
