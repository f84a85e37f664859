//! # FreeRPC
//!
//! The wire protocol of the free invocation fabric: what a call looks like
//! ([`Invocation`]), how it is addressed ([`Message`]), and how a multipart
//! message travels over a byte stream ([`frames`]).
//!
//! ## Architecture
//!
//! Payloads are `freepack` values, so any peer with a MessagePack library can
//! take part. The envelope segments are plain bytes and can be routed without
//! touching the payload.

pub mod error;
pub mod frames;
pub mod invocation;
pub mod message;


pub use error::Error;
pub use error::Result;
pub use invocation::Invocation;
pub use invocation::Request;
pub use invocation::Response;
pub use message::Address;
pub use message::DistributingMode;
pub use message::FrameSet;
pub use message::Message;
pub use message::PROTOCOL;
pub use message::SERIALIZATION_MSGPACK;
pub use message::next_message_id;

pub use freepack::Value;

/// Seconds of heartbeat silence after which a peer is evicted.
pub const HEARTBEAT_LIVETIME: u64 = 10;

pub const DEFAULT_PORT_TCP: u16 = 1061;
pub const DEFAULT_PORT_WEBSOCKET_SSL: u16 = 1062;
pub const DEFAULT_PORT_WEBSOCKET: u16 = 1063;
