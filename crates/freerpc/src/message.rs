//! # Messages
//!
//! The routing envelope around one encoded [`Invocation`].
//!
//! ## Shapes
//! - **Outgoing** (peer to broker), 7 segments:
//!   `[empty, protocol, id, mode, distributing address, serialization, payload]`
//! - **Incoming** (broker to peer), 6 segments:
//!   `[empty, protocol, id, origin address, serialization, payload]`
//!
//! The shape is decided by the segment count alone. An empty origin address means
//! the broker itself answered.
//!
//! ## Invariants
//! - **Opaque Payload**: Parsing never decodes the payload. Forwarding a message
//!   costs no serialization work; [`Message::invocation`] decodes on demand.

use crate::error::Error;
use crate::error::Result;
use crate::invocation::Invocation;

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Protocol tag carried by every message.
pub const PROTOCOL: &[u8] = b"IF1";

/// The only serialization understood by this implementation.
pub const SERIALIZATION_MSGPACK: &str = "Msgpack";

/// One multipart message, segment by segment.
pub type FrameSet = Vec<Vec<u8>>;

static MESSAGE_IDS: AtomicU64 = AtomicU64::new(0);

/// Allocates the next process-wide message ID. Strictly increasing.
pub fn next_message_id() -> String {
    MESSAGE_IDS.fetch_add(1, Ordering::SeqCst).to_string()
}

/// How the broker should deliver an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistributingMode {
    /// Executed by the broker's own registry.
    Broker,
    /// Forwarded to a raw peer address.
    Direct,
    /// Forwarded to whichever peer owns the named service.
    Service,
}

impl DistributingMode {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            DistributingMode::Broker => b"Broker",
            DistributingMode::Direct => b"Direct",
            DistributingMode::Service => b"Service",
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes {
            b"Broker" => Ok(DistributingMode::Broker),
            b"Direct" => Ok(DistributingMode::Direct),
            b"Service" => Ok(DistributingMode::Service),
            other => Err(Error::BadDistributingMode(other.to_vec())),
        }
    }
}

impl fmt::Display for DistributingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DistributingMode::Broker => "Broker",
            DistributingMode::Direct => "Direct",
            DistributingMode::Service => "Service",
        })
    }
}

/// Opaque identity of a peer connection, assigned by the broker.
#[derive(Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Address(Vec<u8>);

impl Address {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Address(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// The broker's own address.
    pub fn is_broker(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for Address {
    fn from(bytes: &[u8]) -> Self {
        Address(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Address {
    fn from(bytes: Vec<u8>) -> Self {
        Address(bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("Broker");
        }
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

const OUTGOING_LEN: usize = 7;
const INCOMING_LEN: usize = 6;

const IDX_PROTOCOL: usize = 1;
const IDX_ID: usize = 2;

/// A parsed, validated frame set.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    segments: FrameSet,
    id: String,
}

impl Message {
    /// Builds an outgoing message from a raw mode tag.
    ///
    /// # Errors
    /// `Error::BadDistributingMode` if `mode` is not a known tag.
    pub fn new(mode: &[u8], address: impl Into<Vec<u8>>, invocation: &Invocation) -> Result<Self> {
        let mode = DistributingMode::from_bytes(mode)?;
        Self::outgoing(mode, address.into(), invocation)
    }

    pub fn new_broker(invocation: &Invocation) -> Result<Self> {
        Self::outgoing(DistributingMode::Broker, Vec::new(), invocation)
    }

    pub fn new_direct(address: &Address, invocation: &Invocation) -> Result<Self> {
        Self::outgoing(DistributingMode::Direct, address.as_bytes().to_vec(), invocation)
    }

    pub fn new_service(service: &str, invocation: &Invocation) -> Result<Self> {
        Self::outgoing(DistributingMode::Service, service.as_bytes().to_vec(), invocation)
    }

    /// Builds an incoming message whose origin is `from`. The broker uses an
    /// empty address for its own responses.
    pub fn new_from_broker(from: &Address, invocation: &Invocation) -> Result<Self> {
        let id = next_message_id();
        let segments = vec![
            Vec::new(),
            PROTOCOL.to_vec(),
            id.clone().into_bytes(),
            from.as_bytes().to_vec(),
            SERIALIZATION_MSGPACK.as_bytes().to_vec(),
            invocation.encode()?,
        ];
        Ok(Message { segments, id })
    }

    fn outgoing(mode: DistributingMode, mut address: Vec<u8>, invocation: &Invocation) -> Result<Self> {
        if mode == DistributingMode::Broker {
            address.clear();
        }
        let id = next_message_id();
        let segments = vec![
            Vec::new(),
            PROTOCOL.to_vec(),
            id.clone().into_bytes(),
            mode.as_bytes().to_vec(),
            address,
            SERIALIZATION_MSGPACK.as_bytes().to_vec(),
            invocation.encode()?,
        ];
        Ok(Message { segments, id })
    }

    /// Validates a received frame set.
    ///
    /// The protocol tag is checked before anything else, so a foreign peer is
    /// reported as `ProtocolMismatch` rather than as a malformed message.
    pub fn parse(segments: FrameSet) -> Result<Self> {
        if segments.len() != OUTGOING_LEN && segments.len() != INCOMING_LEN {
            return Err(Error::MalformedMessage(format!(
                "expected {} or {} segments, found {}",
                OUTGOING_LEN,
                INCOMING_LEN,
                segments.len()
            )));
        }
        if segments[IDX_PROTOCOL] != PROTOCOL {
            return Err(Error::ProtocolMismatch(segments[IDX_PROTOCOL].clone()));
        }
        let id = std::str::from_utf8(&segments[IDX_ID])
            .map_err(|_| Error::MalformedMessage("message id is not UTF-8".into()))?
            .to_owned();
        Ok(Message { segments, id })
    }

    /// Outgoing messages carry a distributing mode; incoming ones an origin.
    pub fn is_outgoing(&self) -> bool {
        self.segments.len() == OUTGOING_LEN
    }

    pub fn message_id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> &[u8] {
        &self.segments[IDX_PROTOCOL]
    }

    /// # Errors
    /// `BadDistributingMode` for an unknown tag, `MalformedMessage` for an
    /// incoming message, which has no mode.
    pub fn distributing_mode(&self) -> Result<DistributingMode> {
        if !self.is_outgoing() {
            return Err(Error::MalformedMessage("incoming message has no distributing mode".into()));
        }
        DistributingMode::from_bytes(&self.segments[3])
    }

    pub fn distributing_address(&self) -> Option<&[u8]> {
        self.is_outgoing().then(|| self.segments[4].as_slice())
    }

    /// The peer that produced an incoming message.
    pub fn from_address(&self) -> Option<Address> {
        (!self.is_outgoing()).then(|| Address::from(self.segments[3].as_slice()))
    }

    pub fn serialization(&self) -> &[u8] {
        let idx = if self.is_outgoing() { 5 } else { 4 };
        &self.segments[idx]
    }

    /// The encoded invocation.
    pub fn payload(&self) -> &[u8] {
        let idx = if self.is_outgoing() { 6 } else { 5 };
        &self.segments[idx]
    }

    /// Decodes the payload.
    pub fn invocation(&self) -> Result<Invocation> {
        if self.serialization() != SERIALIZATION_MSGPACK.as_bytes() {
            return Err(Error::UnsupportedSerialization(
                String::from_utf8_lossy(self.serialization()).into_owned(),
            ));
        }
        Invocation::decode(self.payload())
    }

    /// Rewrites an outgoing message into the incoming shape seen by its
    /// receiver, with `origin` as the sender. The payload is untouched.
    pub fn relay(self, origin: &Address) -> Result<Message> {
        if !self.is_outgoing() {
            return Err(Error::MalformedMessage("only outgoing messages can be relayed".into()));
        }
        let Message { mut segments, id } = self;
        // [e, p, id, mode, addr, ser, payload] -> [e, p, id, origin, ser, payload]
        segments.remove(4);
        segments[3] = origin.as_bytes().to_vec();
        Ok(Message { segments, id })
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    pub fn into_segments(self) -> FrameSet {
        self.segments
    }

    /// Total payload-bearing size, used for traffic statistics.
    pub fn payload_len(&self) -> usize {
        self.payload().len()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let invocation = match self.invocation() {
            Ok(inv) => inv.to_string(),
            Err(e) => format!("<{}>", e),
        };
        if self.is_outgoing() {
            let mode = String::from_utf8_lossy(&self.segments[3]);
            let addr = String::from_utf8_lossy(&self.segments[4]);
            write!(f, "{} [{}]: [id={}] {}", mode, addr, self.id, invocation)
        } else {
            let from = Address::from(self.segments[3].as_slice());
            write!(f, "Receive from [{}]: [id={}] {}", from, self.id, invocation)
        }
    }
}
