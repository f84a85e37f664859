//! # Freepack
//!
//! A small, self-describing binary value codec speaking the MessagePack wire format.
//!
//! ## Philosophy
//!
//! - **Self-Describing**: Every value carries its own type marker, so peers written in
//!   other languages can read the bytes without a schema.
//! - **No Length Prefix**: Value boundaries are determined by the format itself, which is
//!   what lets the [`Unpacker`] split back-to-back values out of a byte stream.
//! - **Bounded**: Decoders are bounds-checked views. Running off the end of the input is
//!   reported as [`Error::UnexpectedEnd`], never as garbage.
//!
//! ## Format
//!
//! - **Scalars**: `[Marker: 1b][Data: 0..8b]` (small integers live inside the marker)
//! - **Blobs**: `[Marker: 1b][Len: 0/1/2/4b][Data: Len]`
//! - **Containers**: `[Marker: 1b][Count: 0/2/4b][Items...]`
//!
//! All multi-byte integers are Big-Endian.

mod unpacker;
mod value;


pub use unpacker::Unpacker;
pub use value::Integer;
pub use value::Value;

/// Maximum container nesting accepted by the [`Decoder`].
pub const MAX_DEPTH: usize = 1024;

/// Freepack serialization and deserialization errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buffer exhausted while reading. For a stream this means "need more bytes".
    UnexpectedEnd,
    /// Byte is not a valid marker (only `0xc1` is reserved by the format).
    InvalidMarker(u8),
    /// String data is not valid UTF-8.
    InvalidUtf8,
    /// Blob or container length exceeds `u32::MAX`.
    TooLarge(usize),
    /// Containers nested deeper than [`MAX_DEPTH`].
    DepthExceeded,
    /// Input continued after the single value that was requested.
    TrailingBytes(usize),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnexpectedEnd => write!(f, "unexpected end of input"),
            Error::InvalidMarker(b) => write!(f, "invalid marker byte: {:#04x}", b),
            Error::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            Error::TooLarge(n) => write!(f, "length {} exceeds the format limit", n),
            Error::DepthExceeded => write!(f, "nesting deeper than {} containers", MAX_DEPTH),
            Error::TrailingBytes(n) => write!(f, "{} trailing bytes after value", n),
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for Freepack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Marker bytes of the wire format.
mod marker {
    pub const POS_FIXINT_MAX: u8 = 0x7f;
    pub const FIXMAP: u8 = 0x80;
    pub const FIXARRAY: u8 = 0x90;
    pub const FIXSTR: u8 = 0xa0;
    pub const NIL: u8 = 0xc0;
    pub const RESERVED: u8 = 0xc1;
    pub const FALSE: u8 = 0xc2;
    pub const TRUE: u8 = 0xc3;
    pub const BIN8: u8 = 0xc4;
    pub const BIN16: u8 = 0xc5;
    pub const BIN32: u8 = 0xc6;
    pub const EXT8: u8 = 0xc7;
    pub const EXT16: u8 = 0xc8;
    pub const EXT32: u8 = 0xc9;
    pub const F32: u8 = 0xca;
    pub const F64: u8 = 0xcb;
    pub const U8: u8 = 0xcc;
    pub const U16: u8 = 0xcd;
    pub const U32: u8 = 0xce;
    pub const U64: u8 = 0xcf;
    pub const I8: u8 = 0xd0;
    pub const I16: u8 = 0xd1;
    pub const I32: u8 = 0xd2;
    pub const I64: u8 = 0xd3;
    pub const FIXEXT1: u8 = 0xd4;
    pub const FIXEXT2: u8 = 0xd5;
    pub const FIXEXT4: u8 = 0xd6;
    pub const FIXEXT8: u8 = 0xd7;
    pub const FIXEXT16: u8 = 0xd8;
    pub const STR8: u8 = 0xd9;
    pub const STR16: u8 = 0xda;
    pub const STR32: u8 = 0xdb;
    pub const ARRAY16: u8 = 0xdc;
    pub const ARRAY32: u8 = 0xdd;
    pub const MAP16: u8 = 0xde;
    pub const MAP32: u8 = 0xdf;
    pub const NEG_FIXINT_MIN: u8 = 0xe0;
}

/// Encodes a single value into a fresh byte vector.
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    enc.value(value)?;
    Ok(enc.into_bytes())
}

/// Decodes exactly one value from `bytes`.
///
/// # Errors
/// Returns `Error::TrailingBytes` if anything follows the value.
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut dec = Decoder::new(bytes);
    let value = dec.value()?;
    if dec.remaining() > 0 {
        return Err(Error::TrailingBytes(dec.remaining()));
    }
    Ok(value)
}

/// An append-only encoder producing the most compact form of each item.
///
/// Containers are length-prefixed by item count, so callers announce the count
/// with `array_header`/`map_header` and then write exactly that many items
/// (twice as many for maps: key, value, key, value...).
pub struct Encoder {
    buf: Vec<u8>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// Creates a new encoder with default capacity.
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(256) }
    }

    /// Consumes the encoder and returns the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Returns a view of the bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    fn checked_len(len: usize) -> Result<u32> {
        u32::try_from(len).map_err(|_| Error::TooLarge(len))
    }

    /// Encodes nil.
    pub fn nil(&mut self) { self.buf.push(marker::NIL); }

    /// Encodes a boolean.
    pub fn bool(&mut self, v: bool) {
        self.buf.push(if v { marker::TRUE } else { marker::FALSE });
    }

    /// Encodes a non-negative integer in its smallest form.
    pub fn uint(&mut self, v: u64) {
        if v <= marker::POS_FIXINT_MAX as u64 {
            self.buf.push(v as u8);
        } else if v <= u8::MAX as u64 {
            self.buf.push(marker::U8);
            self.buf.push(v as u8);
        } else if v <= u16::MAX as u64 {
            self.buf.push(marker::U16);
            self.buf.extend_from_slice(&(v as u16).to_be_bytes());
        } else if v <= u32::MAX as u64 {
            self.buf.push(marker::U32);
            self.buf.extend_from_slice(&(v as u32).to_be_bytes());
        } else {
            self.buf.push(marker::U64);
            self.buf.extend_from_slice(&v.to_be_bytes());
        }
    }

    /// Encodes a signed integer in its smallest form.
    ///
    /// Non-negative values use the unsigned family, matching other MessagePack writers.
    pub fn int(&mut self, v: i64) {
        if v >= 0 {
            self.uint(v as u64);
        } else if v >= -32 {
            self.buf.push(v as i8 as u8);
        } else if v >= i8::MIN as i64 {
            self.buf.push(marker::I8);
            self.buf.push(v as i8 as u8);
        } else if v >= i16::MIN as i64 {
            self.buf.push(marker::I16);
            self.buf.extend_from_slice(&(v as i16).to_be_bytes());
        } else if v >= i32::MIN as i64 {
            self.buf.push(marker::I32);
            self.buf.extend_from_slice(&(v as i32).to_be_bytes());
        } else {
            self.buf.push(marker::I64);
            self.buf.extend_from_slice(&v.to_be_bytes());
        }
    }

    /// Encodes a 32-bit float.
    pub fn f32(&mut self, v: f32) {
        self.buf.push(marker::F32);
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Encodes a 64-bit float.
    pub fn f64(&mut self, v: f64) {
        self.buf.push(marker::F64);
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Encodes a UTF-8 string.
    pub fn str(&mut self, v: &str) -> Result<()> {
        let len = Self::checked_len(v.len())?;
        if len < 32 {
            self.buf.push(marker::FIXSTR | len as u8);
        } else if len <= u8::MAX as u32 {
            self.buf.push(marker::STR8);
            self.buf.push(len as u8);
        } else if len <= u16::MAX as u32 {
            self.buf.push(marker::STR16);
            self.buf.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            self.buf.push(marker::STR32);
            self.buf.extend_from_slice(&len.to_be_bytes());
        }
        self.buf.extend_from_slice(v.as_bytes());
        Ok(())
    }

    /// Encodes a raw byte blob.
    pub fn bytes(&mut self, v: &[u8]) -> Result<()> {
        let len = Self::checked_len(v.len())?;
        if len <= u8::MAX as u32 {
            self.buf.push(marker::BIN8);
            self.buf.push(len as u8);
        } else if len <= u16::MAX as u32 {
            self.buf.push(marker::BIN16);
            self.buf.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            self.buf.push(marker::BIN32);
            self.buf.extend_from_slice(&len.to_be_bytes());
        }
        self.buf.extend_from_slice(v);
        Ok(())
    }

    /// Encodes an extension value (application-defined type tag plus opaque data).
    pub fn ext(&mut self, ty: i8, data: &[u8]) -> Result<()> {
        let len = Self::checked_len(data.len())?;
        match len {
            1 => self.buf.push(marker::FIXEXT1),
            2 => self.buf.push(marker::FIXEXT2),
            4 => self.buf.push(marker::FIXEXT4),
            8 => self.buf.push(marker::FIXEXT8),
            16 => self.buf.push(marker::FIXEXT16),
            n if n <= u8::MAX as u32 => {
                self.buf.push(marker::EXT8);
                self.buf.push(n as u8);
            }
            n if n <= u16::MAX as u32 => {
                self.buf.push(marker::EXT16);
                self.buf.extend_from_slice(&(n as u16).to_be_bytes());
            }
            n => {
                self.buf.push(marker::EXT32);
                self.buf.extend_from_slice(&n.to_be_bytes());
            }
        }
        self.buf.push(ty as u8);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Announces an array of `len` items.
    ///
    /// # Invariants
    /// - Exactly `len` items must follow.
    pub fn array_header(&mut self, len: usize) -> Result<()> {
        let len = Self::checked_len(len)?;
        if len < 16 {
            self.buf.push(marker::FIXARRAY | len as u8);
        } else if len <= u16::MAX as u32 {
            self.buf.push(marker::ARRAY16);
            self.buf.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            self.buf.push(marker::ARRAY32);
            self.buf.extend_from_slice(&len.to_be_bytes());
        }
        Ok(())
    }

    /// Announces a map of `len` entries.
    ///
    /// # Invariants
    /// - Exactly `2 * len` items must follow, alternating key and value.
    pub fn map_header(&mut self, len: usize) -> Result<()> {
        let len = Self::checked_len(len)?;
        if len < 16 {
            self.buf.push(marker::FIXMAP | len as u8);
        } else if len <= u16::MAX as u32 {
            self.buf.push(marker::MAP16);
            self.buf.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            self.buf.push(marker::MAP32);
            self.buf.extend_from_slice(&len.to_be_bytes());
        }
        Ok(())
    }

    /// Encodes a whole value tree.
    pub fn value(&mut self, v: &Value) -> Result<()> {
        match v {
            Value::Nil => self.nil(),
            Value::Bool(b) => self.bool(*b),
            Value::Integer(i) => match i.as_u64() {
                Some(u) => self.uint(u),
                None => self.int(i.as_i64().unwrap_or(i64::MIN)),
            },
            Value::F32(x) => self.f32(*x),
            Value::F64(x) => self.f64(*x),
            Value::String(s) => self.str(s)?,
            Value::Binary(b) => self.bytes(b)?,
            Value::Array(items) => {
                self.array_header(items.len())?;
                for item in items {
                    self.value(item)?;
                }
            }
            Value::Map(entries) => {
                self.map_header(entries.len())?;
                for (k, val) in entries {
                    self.value(k)?;
                    self.value(val)?;
                }
            }
            Value::Ext(ty, data) => self.ext(*ty, data)?,
        }
        Ok(())
    }
}

/// A bounds-checked cursor over a byte slice.
///
/// Reading advances the internal cursor. A failed read may leave the cursor
/// anywhere inside the value; callers that need to retry (the [`Unpacker`])
/// work on a fresh decoder each time.
///
/// # Errors
/// All read operations return `Error::UnexpectedEnd` if the buffer is exhausted.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    missing: usize,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over the slice.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, missing: 0 }
    }

    /// Returns the remaining bytes in the view.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// After `Error::UnexpectedEnd`, how many more bytes the failed read
    /// wanted. A lower bound on what the value still lacks.
    pub fn missing(&self) -> usize {
        self.missing
    }

    fn read_u8(&mut self) -> Result<u8> {
        let Some((&b, rest)) = self.buf.split_first() else {
            self.missing = 1;
            return Err(Error::UnexpectedEnd);
        };
        self.buf = rest;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            self.missing = n - self.buf.len();
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn read_u16(&mut self) -> Result<u16> { Ok(u16::from_be_bytes(self.read_array()?)) }
    fn read_u32(&mut self) -> Result<u32> { Ok(u32::from_be_bytes(self.read_array()?)) }
    fn read_u64(&mut self) -> Result<u64> { Ok(u64::from_be_bytes(self.read_array()?)) }

    fn read_str(&mut self, len: usize) -> Result<String> {
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| Error::InvalidUtf8)
    }

    fn read_ext(&mut self, len: usize) -> Result<Value> {
        let ty = self.read_u8()? as i8;
        let data = self.read_bytes(len)?;
        Ok(Value::Ext(ty, data.to_vec()))
    }

    fn read_items(&mut self, count: usize, depth: usize) -> Result<Vec<Value>> {
        // Every item takes at least one byte; never trust the header for capacity.
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(self.value_at(depth + 1)?);
        }
        Ok(items)
    }

    fn read_entries(&mut self, count: usize, depth: usize) -> Result<Vec<(Value, Value)>> {
        let mut entries = Vec::with_capacity(count.min(self.remaining() / 2));
        for _ in 0..count {
            let key = self.value_at(depth + 1)?;
            let val = self.value_at(depth + 1)?;
            entries.push((key, val));
        }
        Ok(entries)
    }

    /// Decodes the next complete value tree.
    pub fn value(&mut self) -> Result<Value> {
        self.value_at(0)
    }

    fn value_at(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::DepthExceeded);
        }
        let m = self.read_u8()?;
        let value = match m {
            0x00..=marker::POS_FIXINT_MAX => Value::from(m as u64),
            0x80..=0x8f => Value::Map(self.read_entries((m & 0x0f) as usize, depth)?),
            0x90..=0x9f => Value::Array(self.read_items((m & 0x0f) as usize, depth)?),
            0xa0..=0xbf => Value::String(self.read_str((m & 0x1f) as usize)?),
            marker::NIL => Value::Nil,
            marker::RESERVED => return Err(Error::InvalidMarker(m)),
            marker::FALSE => Value::Bool(false),
            marker::TRUE => Value::Bool(true),
            marker::BIN8 => {
                let len = self.read_u8()? as usize;
                Value::Binary(self.read_bytes(len)?.to_vec())
            }
            marker::BIN16 => {
                let len = self.read_u16()? as usize;
                Value::Binary(self.read_bytes(len)?.to_vec())
            }
            marker::BIN32 => {
                let len = self.read_u32()? as usize;
                Value::Binary(self.read_bytes(len)?.to_vec())
            }
            marker::EXT8 => {
                let len = self.read_u8()? as usize;
                self.read_ext(len)?
            }
            marker::EXT16 => {
                let len = self.read_u16()? as usize;
                self.read_ext(len)?
            }
            marker::EXT32 => {
                let len = self.read_u32()? as usize;
                self.read_ext(len)?
            }
            marker::F32 => Value::F32(f32::from_be_bytes(self.read_array()?)),
            marker::F64 => Value::F64(f64::from_be_bytes(self.read_array()?)),
            marker::U8 => Value::from(self.read_u8()? as u64),
            marker::U16 => Value::from(self.read_u16()? as u64),
            marker::U32 => Value::from(self.read_u32()? as u64),
            marker::U64 => Value::from(self.read_u64()?),
            marker::I8 => Value::from(self.read_u8()? as i8 as i64),
            marker::I16 => Value::from(self.read_u16()? as i16 as i64),
            marker::I32 => Value::from(self.read_u32()? as i32 as i64),
            marker::I64 => Value::from(self.read_u64()? as i64),
            marker::FIXEXT1 => self.read_ext(1)?,
            marker::FIXEXT2 => self.read_ext(2)?,
            marker::FIXEXT4 => self.read_ext(4)?,
            marker::FIXEXT8 => self.read_ext(8)?,
            marker::FIXEXT16 => self.read_ext(16)?,
            marker::STR8 => {
                let len = self.read_u8()? as usize;
                Value::String(self.read_str(len)?)
            }
            marker::STR16 => {
                let len = self.read_u16()? as usize;
                Value::String(self.read_str(len)?)
            }
            marker::STR32 => {
                let len = self.read_u32()? as usize;
                Value::String(self.read_str(len)?)
            }
            marker::ARRAY16 => {
                let len = self.read_u16()? as usize;
                Value::Array(self.read_items(len, depth)?)
            }
            marker::ARRAY32 => {
                let len = self.read_u32()? as usize;
                Value::Array(self.read_items(len, depth)?)
            }
            marker::MAP16 => {
                let len = self.read_u16()? as usize;
                Value::Map(self.read_entries(len, depth)?)
            }
            marker::MAP32 => {
                let len = self.read_u32()? as usize;
                Value::Map(self.read_entries(len, depth)?)
            }
            marker::NEG_FIXINT_MIN..=0xff => Value::from(m as i8 as i64),
        };
        Ok(value)
    }
}
