//! Topic-addressed peer-to-peer message server
//!
//! `peermux` is the server side of a low-latency, at-least-once message bus
//! for a cluster of cooperating nodes. Remote peers open one bidirectional
//! stream each and push batches of topic-addressed messages; the server
//! dispatches them to registered handlers through a bounded worker pool,
//! detects gaps and duplicates with per-(sender, topic) sequence numbers,
//! and acknowledges delivery in periodic batches. Stale and duplicate
//! streams from reconnecting peers are arbitrated by a per-sender epoch.
//!
//! ## Architecture
//!
//! - All mutations of the handler table, pending buffer, and peer lifecycle
//!   flow through a single task queue ([`server`]), so those structures
//!   need no locking.
//! - Each open stream is served by a receive task and a send task; the
//!   receive task enqueues blocking so a saturated server back-pressures
//!   the sender, and the send task paces frames with a per-stream rate
//!   limit.
//! - Handlers run on a fixed worker pool ([`worker_pool`]), pinned so that
//!   events for one topic execute serially.
//! - The transport substrate is abstracted behind [`PacketSource`] and
//!   [`PacketSink`]; any ordered, reliable, framed stream (such as an
//!   HTTP/2 stream) can carry the protocol. An in-memory link is provided
//!   for tests and in-process wiring.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use peermux::{MessageServer, ServerConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> peermux::Result<()> {
//! let server = Arc::new(MessageServer::new("node-1", ServerConfig::default()));
//! tokio::spawn(Arc::clone(&server).run(None));
//!
//! let _err_rx = server
//!     .sync_add_handler("greetings", |sender, text: String| {
//!         println!("{sender} says {text}");
//!         Ok(())
//!     })
//!     .await?;
//! // Hand accepted streams to `server.send_message(source, sink)`.
//! # Ok(())
//! # }
//! ```

mod acks;
mod config;
mod errors;
mod metrics;
mod peers;
mod pending;
pub mod protocol;
mod server;
mod stream_handle;
mod transport;
mod types;
mod worker_pool;

pub use config::ServerConfig;
pub use errors::{Result, ServerError};
pub use metrics::MetricsSnapshot;
pub use protocol::wire::{
    decode_payload, encode_payload, error_to_response, Ack, ExitReason, MessagePacket,
    SendMessageResponse,
};
pub use server::MessageServer;
pub use transport::{
    memory_link, MemoryPacketSink, MemoryPacketSource, MemoryPeerLink, PacketSink, PacketSource,
};
pub use types::{
    Epoch, MessageEntry, NodeId, RawMessageEntry, Seq, StreamMeta, Topic, INIT_ACK,
};
