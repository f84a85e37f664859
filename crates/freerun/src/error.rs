use std::fmt;

use crate::runtime::RuntimeError;
use crate::transport::TransportError;

/// Everything a caller of the fabric can observe going wrong.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Building or decoding a message failed locally.
    Rpc(freerpc::Error),
    /// The connection failed underneath us.
    Transport(TransportError),
    /// The remote side answered with an error description.
    Remote(String),
    /// No response arrived before the deadline.
    Timeout,
    /// The connection closed while the call was pending.
    ConnectionLost,
    /// A message ID was sent twice while the first was still pending.
    DuplicateMessageId(String),
    /// `bind_service` was called on a worker that already has a service.
    ServiceAlreadyBound,
    /// A blocking API was called from inside an async runtime.
    BlockingInRuntime,
    Runtime(RuntimeError),
    /// An endpoint string could not be parsed.
    Endpoint(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "RPC error: {}", e),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Remote(description) => f.write_str(description),
            Self::Timeout => write!(f, "Time out!"),
            Self::ConnectionLost => write!(f, "Connection lost"),
            Self::DuplicateMessageId(id) => write!(f, "MessageID [{}] have been used.", id),
            Self::ServiceAlreadyBound => write!(f, "Service already bind."),
            Self::BlockingInRuntime => {
                write!(f, "Blocking call issued from inside an async runtime; use the async API")
            }
            Self::Runtime(e) => write!(f, "Runtime error: {}", e),
            Self::Endpoint(msg) => write!(f, "Invalid endpoint: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<freerpc::Error> for Error {
    fn from(e: freerpc::Error) -> Self {
        Self::Rpc(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<RuntimeError> for Error {
    fn from(e: RuntimeError) -> Self {
        Self::Runtime(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
