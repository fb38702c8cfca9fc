//! Core types for the peer-to-peer message server
//!
//! Identifiers are opaque strings so that callers can reuse whatever naming
//! scheme their cluster already has. Sequence numbers and epochs are signed
//! 64-bit integers assigned by the sending side.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Identifiers
// ----------------------------------------------------------------------------

/// Stable identifier of a node, unchanged across reconnects.
pub type NodeId = String;

/// Key naming a logical channel of typed messages.
pub type Topic = String;

/// Per-(sender, topic) strictly increasing sequence number, starting at 1.
pub type Seq = i64;

/// Per-sender generation counter, bumped by the client on every reconnect.
pub type Epoch = i64;

/// Sentinel acknowledgment value meaning "no message delivered yet".
pub const INIT_ACK: Seq = 0;

// ----------------------------------------------------------------------------
// Stream Metadata
// ----------------------------------------------------------------------------

/// Metadata carried in the first frame of a stream, immutable for the
/// stream's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMeta {
    /// Identifier of the sending node.
    pub sender_id: NodeId,
    /// Identifier of the node this stream is intended for.
    pub receiver_id: NodeId,
    /// Address the sender advertises for diagnostics.
    pub sender_advertised_addr: String,
    /// Connection generation; a larger epoch supersedes a smaller one.
    pub epoch: Epoch,
    /// Version string of the client, checked when the server gates versions.
    pub client_version: String,
}

impl StreamMeta {
    /// Validate the structural requirements on stream metadata.
    pub fn validate(&self) -> Result<(), String> {
        if self.sender_id.is_empty() {
            return Err("sender id is empty".into());
        }
        if self.receiver_id.is_empty() {
            return Err("receiver id is empty".into());
        }
        Ok(())
    }
}

impl fmt::Display for StreamMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} (epoch {})",
            self.sender_id, self.sender_advertised_addr, self.epoch
        )
    }
}

// ----------------------------------------------------------------------------
// Message Entries
// ----------------------------------------------------------------------------

/// A single topic-addressed message as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntry {
    /// Topic this entry belongs to.
    pub topic: Topic,
    /// Sequence number assigned by the sender for this (sender, topic).
    pub sequence: Seq,
    /// Opaque encoded payload, decoded by the registered handler.
    pub content: Vec<u8>,
}

impl MessageEntry {
    /// Approximate wire size of this entry in bytes.
    pub fn wire_size(&self) -> usize {
        self.topic.len() + std::mem::size_of::<Seq>() + self.content.len()
    }
}

/// An in-process message that joins the dispatch path without a transport.
///
/// The payload is already a typed value, so no decoding happens when the
/// handler consumes it.
pub struct RawMessageEntry {
    /// Topic this entry belongs to.
    pub topic: Topic,
    /// The typed payload, downcast by the handler to its expected type.
    pub value: Box<dyn Any + Send>,
}

impl RawMessageEntry {
    /// Create a raw entry carrying `value` for `topic`.
    pub fn new<T: Send + 'static>(topic: impl Into<Topic>, value: T) -> Self {
        Self {
            topic: topic.into(),
            value: Box::new(value),
        }
    }
}

impl fmt::Debug for RawMessageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMessageEntry")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
