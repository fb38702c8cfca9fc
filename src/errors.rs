//! Error types for the message server
//!
//! Every failure that can cross the API or the wire is a variant of
//! [`ServerError`]. The mapping from errors to wire-visible exit reasons
//! lives in [`crate::protocol::wire`].

use crate::types::{Epoch, NodeId, Seq, Topic};

// ----------------------------------------------------------------------------
// Server Errors
// ----------------------------------------------------------------------------

/// Errors surfaced by the message server, on the API or on the wire.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerError {
    /// The first frame of a stream carried missing or malformed metadata.
    #[error("illegal stream metadata: {reason}")]
    IllegalMeta { reason: String },

    /// The stream was addressed to a different node.
    #[error("stream intended for receiver {actual}, but this server is {expected}")]
    ReceiverMismatch { expected: NodeId, actual: NodeId },

    /// The client's version does not match the gated server version.
    #[error("server version {server} does not match client version {client}")]
    VersionMismatch { server: String, client: String },

    /// The server already holds its configured maximum number of peers.
    #[error("peer limit reached ({count} peers connected)")]
    TooManyPeers { count: usize },

    /// A stream lost the epoch arbitration for its sender.
    #[error("stale stream for peer {peer_id}: epoch {old_epoch} superseded by epoch {new_epoch}")]
    StaleConnection {
        peer_id: NodeId,
        old_epoch: Epoch,
        new_epoch: Epoch,
    },

    /// A second stream arrived for a sender at the same epoch.
    #[error("duplicate stream for peer {peer_id} at epoch {epoch}")]
    DuplicateConnection { peer_id: NodeId, epoch: Epoch },

    /// The pending buffer for a topic with no handler overflowed.
    #[error("topic {topic} congested: no handler registered and pending buffer is full")]
    TopicCongested { topic: Topic },

    /// The core task queue is full; the caller should retry.
    #[error("server task queue congested")]
    TaskQueueCongested,

    /// A gap was detected in a sender's sequence numbers.
    #[error("data lost for topic {topic}: expected sequence {expected_seq}")]
    DataLost { topic: Topic, expected_seq: Seq },

    /// A message payload could not be decoded into the handler's type.
    #[error("failed to decode message content for topic {topic}: {reason}")]
    Decode { topic: Topic, reason: String },

    /// The handler for a topic returned an error and stopped.
    #[error("handler for topic {topic} failed: {reason}")]
    HandlerFailed { topic: Topic, reason: String },

    /// A handler did not drain its queued events within the graceful bound.
    #[error("handler for topic {topic} did not drain in time and was removed forcefully")]
    UnregisterTimeout { topic: Topic },

    /// The per-stream send queue has been closed.
    #[error("stream send queue is closed")]
    SenderClosed,

    /// The per-stream send queue is full.
    #[error("stream send queue is full")]
    SendQueueFull,

    /// The server has been closed.
    #[error("message server is closed")]
    ServerClosed,

    /// The server is already running; `run` may only be called once.
    #[error("message server is already running")]
    AlreadyRunning,

    /// The underlying transport failed.
    #[error("transport failure: {message}")]
    Transport { message: String },
}

impl ServerError {
    /// Create an illegal-metadata error with a reason.
    pub fn illegal_meta(reason: impl Into<String>) -> Self {
        ServerError::IllegalMeta {
            reason: reason.into(),
        }
    }

    /// Create a transport error with a message.
    pub fn transport(message: impl Into<String>) -> Self {
        ServerError::Transport {
            message: message.into(),
        }
    }

    /// Create a decode error for a topic.
    pub fn decode(topic: impl Into<Topic>, reason: impl Into<String>) -> Self {
        ServerError::Decode {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Create a handler-failure error for a topic.
    pub fn handler_failed(topic: impl Into<Topic>, reason: impl Into<String>) -> Self {
        ServerError::HandlerFailed {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Alias
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, ServerError>;
