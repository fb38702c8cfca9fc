//! Wire packet types and their translation to and from server errors
//!
//! The transport delivers these structs as framed, ordered messages; how
//! they are framed onto bytes is the transport's business. Payload contents
//! inside [`MessageEntry`] are encoded with bincode via [`encode_payload`]
//! and decoded by the registered handler.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, ServerError};
use crate::types::{MessageEntry, Seq, StreamMeta, Topic};

// ----------------------------------------------------------------------------
// Exit Reasons
// ----------------------------------------------------------------------------

/// Wire-visible reason attached to every server frame.
///
/// Anything other than [`ExitReason::Ok`] tells the peer why the stream is
/// being terminated, or that it should back off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExitReason {
    /// Normal frame; the stream stays open.
    Ok = 0,
    /// The server is overloaded for this peer; back off and reconnect.
    Congested = 1,
    /// A newer stream for the same sender has superseded this one.
    StaleConnection = 2,
    /// The stream was addressed to a different receiver.
    ReceiverMismatch = 3,
    /// Any other failure; details are in the error message.
    Unknown = 4,
}

// ----------------------------------------------------------------------------
// Packets
// ----------------------------------------------------------------------------

/// A single per-topic acknowledgment inside a server frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Topic the acknowledgment is for.
    pub topic: Topic,
    /// Highest sequence delivered to the handler for this (peer, topic).
    pub last_seq: Seq,
}

/// A client frame: stream metadata on the first frame, message entries on
/// every frame after that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePacket {
    /// Present and validated on the first frame; ignored afterwards.
    pub meta: Option<StreamMeta>,
    /// Batch of messages, possibly empty.
    pub entries: Vec<MessageEntry>,
}

impl MessagePacket {
    /// Approximate wire size of this packet in bytes.
    pub fn wire_size(&self) -> usize {
        self.entries.iter().map(MessageEntry::wire_size).sum()
    }
}

/// A server frame: batched acknowledgments plus an exit reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    /// Acknowledgments for every topic with delivered messages.
    pub acks: Vec<Ack>,
    /// Why this frame was sent; `Ok` for ordinary acknowledgment traffic.
    pub exit_reason: ExitReason,
    /// Human-readable detail accompanying a non-`Ok` exit reason.
    pub error_message: String,
}

impl SendMessageResponse {
    /// An ordinary acknowledgment frame.
    pub fn acks(acks: Vec<Ack>) -> Self {
        Self {
            acks,
            exit_reason: ExitReason::Ok,
            error_message: String::new(),
        }
    }
}

// ----------------------------------------------------------------------------
// Error Translation
// ----------------------------------------------------------------------------

/// Map a server error to the frame that tells the peer about it.
pub fn error_to_response(err: &ServerError) -> SendMessageResponse {
    let exit_reason = match err {
        ServerError::TopicCongested { .. } | ServerError::TaskQueueCongested => {
            ExitReason::Congested
        }
        ServerError::StaleConnection { .. } => ExitReason::StaleConnection,
        ServerError::ReceiverMismatch { .. } => ExitReason::ReceiverMismatch,
        _ => ExitReason::Unknown,
    };
    SendMessageResponse {
        acks: Vec::new(),
        exit_reason,
        error_message: err.to_string(),
    }
}

// ----------------------------------------------------------------------------
// Payload Codec
// ----------------------------------------------------------------------------

/// Encode a typed payload into the opaque content of a [`MessageEntry`].
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| ServerError::transport(format!("payload encoding failed: {e}")))
}

/// Decode the opaque content of a [`MessageEntry`] into a typed payload.
pub fn decode_payload<T: DeserializeOwned>(content: &[u8]) -> core::result::Result<T, String> {
    bincode::deserialize(content).map_err(|e| e.to_string())
}
