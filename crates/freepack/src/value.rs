//! Dynamically typed value tree.

use std::fmt;

/// An integer in the `i64 ∪ u64` range.
///
/// Non-negative numbers are always stored unsigned, so the same number has
/// exactly one representation regardless of which Rust type produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Integer(IntRepr);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum IntRepr {
    PosInt(u64),
    /// Always strictly negative.
    NegInt(i64),
}

impl Integer {
    /// Returns the value as `i64`, if it fits.
    pub fn as_i64(&self) -> Option<i64> {
        match self.0 {
            IntRepr::PosInt(u) => i64::try_from(u).ok(),
            IntRepr::NegInt(i) => Some(i),
        }
    }

    /// Returns the value as `u64`, if it is non-negative.
    pub fn as_u64(&self) -> Option<u64> {
        match self.0 {
            IntRepr::PosInt(u) => Some(u),
            IntRepr::NegInt(_) => None,
        }
    }

    /// Lossy conversion to a float.
    pub fn as_f64(&self) -> f64 {
        match self.0 {
            IntRepr::PosInt(u) => u as f64,
            IntRepr::NegInt(i) => i as f64,
        }
    }

    pub fn is_negative(&self) -> bool {
        matches!(self.0, IntRepr::NegInt(_))
    }
}

impl From<u64> for Integer {
    fn from(v: u64) -> Self {
        Integer(IntRepr::PosInt(v))
    }
}

impl From<i64> for Integer {
    fn from(v: i64) -> Self {
        if v < 0 {
            Integer(IntRepr::NegInt(v))
        } else {
            Integer(IntRepr::PosInt(v as u64))
        }
    }
}

macro_rules! integer_from {
    ($($unsigned:ty),* ; $($signed:ty),*) => {
        $(impl From<$unsigned> for Integer {
            fn from(v: $unsigned) -> Self { Integer::from(v as u64) }
        })*
        $(impl From<$signed> for Integer {
            fn from(v: $signed) -> Self { Integer::from(v as i64) }
        })*
    };
}

integer_from!(u8, u16, u32, usize; i8, i16, i32, isize);

impl fmt::Display for Integer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            IntRepr::PosInt(u) => write!(f, "{}", u),
            IntRepr::NegInt(i) => write!(f, "{}", i),
        }
    }
}

/// A self-describing value, the unit of everything that crosses the wire.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Integer(Integer),
    F32(f32),
    F64(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    /// Insertion-ordered; keys may be any value.
    Map(Vec<(Value, Value)>),
    /// Extension type, carried opaquely.
    Ext(i8, Vec<u8>),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => i.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Integer(i) => i.as_u64(),
            _ => None,
        }
    }

    /// Any numeric value as a float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(i.as_f64()),
            Value::F32(x) => Some(*x as f64),
            Value::F64(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up a string key in a map. Returns `None` for non-maps.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// Builds a map from string keys.
    pub fn map<K, V, I>(entries: I) -> Value
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::String(k.into()), v.into()))
                .collect(),
        )
    }
}

macro_rules! value_from_integer {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self { Value::Integer(Integer::from(v)) }
        })*
    };
}

value_from_integer!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl From<Integer> for Value {
    fn from(v: Integer) -> Self {
        Value::Integer(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Binary(v.to_vec())
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Nil, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::F32(x) => write!(f, "{}", x),
            Value::F64(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Binary(b) => {
                write!(f, "b\"")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                write!(f, "\"")
            }
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Ext(ty, data) => write!(f, "ext({}, {} bytes)", ty, data.len()),
        }
    }
}
