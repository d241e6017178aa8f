//! Message envelope — the in-memory representation of an HMQ frame
//!
//! A [`Message`] is immutable after creation except for its routing
//! metadata (id, source, target). Content is an opaque byte stream;
//! helpers exist for string and JSON payloads.

use bytes::Bytes;

use crate::error::Result;

/// Header name carried by negative acknowledgements
pub const NEGATIVE_ACK_HEADER: &str = "Negative-Ack";

/// Default negative-ack reason when none is given
pub const NACK_REASON_NONE: &str = "none";

/// Default hop count for new messages
pub const DEFAULT_TTL: i8 = 16;

/// Message types on the wire
///
/// The discriminants are the wire values of the frame type byte.
/// `Ping`/`Pong` are fixed 8-byte control frames (see [`crate::codec`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Broker control traffic (hello, queue management, lists)
    Server = 0x10,
    /// Connection teardown request
    Terminate = 0x18,
    /// Keep-alive probe
    Ping = 0x89,
    /// Keep-alive reply
    Pong = 0x8A,
    /// Client-to-client message
    DirectMessage = 0x28,
    /// Reply correlated to an earlier `wait_response` message
    Response = 0x30,
    /// Positive or negative delivery confirmation
    Acknowledge = 0x38,
    /// Message stored in and dispatched from a queue
    QueueMessage = 0x40,
    /// Explicit fetch from a pull queue
    QueuePullRequest = 0x48,
    /// Broker event notification
    Event = 0x50,
    /// Message routed through a router's bindings
    Router = 0x58,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::error::HmqError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x10 => Ok(Self::Server),
            0x18 => Ok(Self::Terminate),
            0x89 => Ok(Self::Ping),
            0x8A => Ok(Self::Pong),
            0x28 => Ok(Self::DirectMessage),
            0x30 => Ok(Self::Response),
            0x38 => Ok(Self::Acknowledge),
            0x40 => Ok(Self::QueueMessage),
            0x48 => Ok(Self::QueuePullRequest),
            0x50 => Ok(Self::Event),
            0x58 => Ok(Self::Router),
            _ => Err(crate::error::HmqError::Frame(format!(
                "Unknown message type: 0x{:02x}",
                value
            ))),
        }
    }
}

/// A single message in the system
///
/// `target` is a queue name, a client id, or a routed name using the
/// `@name:X` / `@type:T` prefixes. For queue messages `content_type`
/// is the queue id; for server frames it is a well-known content-type
/// code (see [`crate::codec::content_types`]).
#[derive(Debug, Clone)]
pub struct Message {
    /// Frame type
    pub kind: MessageType,

    /// Message id — opaque string, unique per producing connection when set
    pub id: String,

    /// Originator client id
    pub source: String,

    /// Queue name, client id, or routed name
    pub target: String,

    /// Content-type code (queue id for queue messages)
    pub content_type: u16,

    /// Remaining hop count; the message is dropped when it goes below zero
    pub ttl: i8,

    /// Deliver only to the first receiver found when several match
    pub first_acquirer_only: bool,

    /// Enqueue ahead of regular messages
    pub high_priority: bool,

    /// The sender expects a correlated `Response` frame
    pub wait_response: bool,

    /// The sender expects an `Acknowledge` frame
    pub pending_acknowledge: bool,

    /// Ordered name/value pairs
    pub headers: Vec<(String, String)>,

    /// Opaque payload
    pub content: Bytes,
}

impl Message {
    /// Create an empty message of the given type
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            id: String::new(),
            source: String::new(),
            target: String::new(),
            content_type: 0,
            ttl: DEFAULT_TTL,
            first_acquirer_only: false,
            high_priority: false,
            wait_response: false,
            pending_acknowledge: false,
            headers: Vec::new(),
            content: Bytes::new(),
        }
    }

    /// Create a queue message bound for `queue` with the given queue id
    pub fn queue(queue: impl Into<String>, queue_id: u16) -> Self {
        let mut message = Self::new(MessageType::QueueMessage);
        message.target = queue.into();
        message.content_type = queue_id;
        message
    }

    /// Create a direct message bound for a client id or `@name:`/`@type:` target
    pub fn direct(target: impl Into<String>, content_type: u16) -> Self {
        let mut message = Self::new(MessageType::DirectMessage);
        message.target = target.into();
        message.content_type = content_type;
        message
    }

    /// Set the target
    pub fn set_target(&mut self, target: impl Into<String>) {
        self.target = target.into();
    }

    /// Set the source
    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = source.into();
    }

    /// Set the message id
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    /// Assign a fresh generated message id
    pub fn assign_id(&mut self) {
        self.id = format!("msg-{}", uuid::Uuid::new_v4());
    }

    /// Add a header, preserving insertion order
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header value with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set raw byte content
    pub fn set_content(&mut self, content: impl Into<Bytes>) {
        self.content = content.into();
    }

    /// Set string content
    pub fn set_string_content(&mut self, content: impl AsRef<str>) {
        self.content = Bytes::copy_from_slice(content.as_ref().as_bytes());
    }

    /// Serialize a value as JSON content
    pub fn set_json_content<T: serde::Serialize>(&mut self, value: &T) -> Result<()> {
        self.content = Bytes::from(serde_json::to_vec(value)?);
        Ok(())
    }

    /// Content as UTF-8, lossy
    pub fn content_string(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    /// Deserialize JSON content
    pub fn json_content<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.content)?)
    }

    /// Copy this message, optionally replacing the id and dropping content
    ///
    /// Routing metadata and flags are always copied. With `copy_content`
    /// false the clone carries an empty payload.
    pub fn clone_with(&self, new_id: Option<String>, copy_content: bool) -> Self {
        let mut clone = self.clone();
        if let Some(id) = new_id {
            clone.id = id;
        }
        if !copy_content {
            clone.content = Bytes::new();
        }
        clone
    }

    /// Build the acknowledgement for this message
    ///
    /// The ack carries the original message id with `source` and `target`
    /// swapped. A `reason` makes it a negative ack via the
    /// [`NEGATIVE_ACK_HEADER`] header; `None` produces a positive ack
    /// with an empty body.
    pub fn create_acknowledge(&self, reason: Option<&str>) -> Message {
        let mut ack = Message::new(MessageType::Acknowledge);
        ack.id = self.id.clone();
        ack.content_type = self.content_type;
        ack.source = self.target.clone();
        ack.target = self.source.clone();
        if let Some(reason) = reason {
            let reason = if reason.is_empty() { NACK_REASON_NONE } else { reason };
            ack.headers.push((NEGATIVE_ACK_HEADER.to_string(), reason.to_string()));
        }
        ack
    }

    /// Build the response frame for this message (same id, target = source)
    pub fn create_response(&self) -> Message {
        let mut response = Message::new(MessageType::Response);
        response.id = self.id.clone();
        response.content_type = self.content_type;
        response.source = self.target.clone();
        response.target = self.source.clone();
        response
    }

    /// Whether this acknowledge frame is negative
    pub fn is_negative_ack(&self) -> bool {
        self.header(NEGATIVE_ACK_HEADER).is_some()
    }

    /// Negative-ack reason, if any
    pub fn negative_ack_reason(&self) -> Option<&str> {
        self.header(NEGATIVE_ACK_HEADER)
    }
}
