use std::fmt;

/// Failures while building, parsing or decoding messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The payload bytes are not a valid value.
    Pack(freepack::Error),
    /// The protocol tag segment is not [`PROTOCOL`](crate::PROTOCOL).
    ProtocolMismatch(Vec<u8>),
    /// The distributing mode is not one of `Broker`, `Direct`, `Service`.
    BadDistributingMode(Vec<u8>),
    /// The frame set has neither the outgoing nor the incoming shape.
    MalformedMessage(String),
    /// A serialization other than `Msgpack` was requested.
    UnsupportedSerialization(String),
    /// The payload is a value, but not a request or response.
    MalformedInvocation(String),
    /// A frame-set stream is corrupt or exceeds limits.
    Framing(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Pack(e) => write!(f, "payload decode failed: {}", e),
            Error::ProtocolMismatch(tag) => {
                write!(f, "protocol mismatch: {}", String::from_utf8_lossy(tag))
            }
            Error::BadDistributingMode(mode) => {
                write!(f, "Bad DistributingMode: {}", String::from_utf8_lossy(mode))
            }
            Error::MalformedMessage(msg) => write!(f, "malformed message: {}", msg),
            Error::UnsupportedSerialization(s) => write!(f, "Bad serialization: {}", s),
            Error::MalformedInvocation(msg) => write!(f, "malformed invocation: {}", msg),
            Error::Framing(msg) => write!(f, "framing error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Pack(e) => Some(e),
            _ => None,
        }
    }
}

impl From<freepack::Error> for Error {
    fn from(e: freepack::Error) -> Self {
        Error::Pack(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
