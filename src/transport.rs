//! Transport seam between the server and its byte-stream substrate
//!
//! The server only requires an ordered, reliable, framed packet stream per
//! peer connection. A gRPC or HTTP/2 binding implements [`PacketSource`]
//! and [`PacketSink`] over its stream halves; tests use the in-memory link
//! below.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{Result, ServerError};
use crate::protocol::wire::{MessagePacket, SendMessageResponse};

// ----------------------------------------------------------------------------
// Stream Traits
// ----------------------------------------------------------------------------

/// Receiving half of a peer connection, as seen by the server.
#[async_trait]
pub trait PacketSource: Send + 'static {
    /// Receive the next client frame. `Ok(None)` means the peer closed the
    /// stream cleanly.
    async fn recv(&mut self) -> Result<Option<MessagePacket>>;
}

/// Sending half of a peer connection, as seen by the server.
#[async_trait]
pub trait PacketSink: Send + 'static {
    /// Send a server frame to the peer.
    async fn send(&mut self, response: SendMessageResponse) -> Result<()>;
}

// ----------------------------------------------------------------------------
// In-Memory Link
// ----------------------------------------------------------------------------

/// Client end of an in-memory peer connection.
///
/// Useful for tests and for wiring two servers inside one process.
#[derive(Debug)]
pub struct MemoryPeerLink {
    packet_tx: mpsc::Sender<MessagePacket>,
    response_rx: mpsc::Receiver<SendMessageResponse>,
}

impl MemoryPeerLink {
    /// Send a client frame to the server.
    pub async fn send_packet(&self, packet: MessagePacket) -> Result<()> {
        self.packet_tx
            .send(packet)
            .await
            .map_err(|_| ServerError::transport("peer link closed"))
    }

    /// Receive the next server frame. `None` means the server side closed.
    pub async fn recv_response(&mut self) -> Option<SendMessageResponse> {
        self.response_rx.recv().await
    }

    /// Close the client-to-server direction, as a disconnecting peer would.
    pub fn close(self) {
        drop(self.packet_tx);
    }
}

/// Server-side receiving half of an in-memory link.
#[derive(Debug)]
pub struct MemoryPacketSource {
    rx: mpsc::Receiver<MessagePacket>,
}

#[async_trait]
impl PacketSource for MemoryPacketSource {
    async fn recv(&mut self) -> Result<Option<MessagePacket>> {
        Ok(self.rx.recv().await)
    }
}

/// Server-side sending half of an in-memory link.
#[derive(Debug)]
pub struct MemoryPacketSink {
    tx: mpsc::Sender<SendMessageResponse>,
}

#[async_trait]
impl PacketSink for MemoryPacketSink {
    async fn send(&mut self, response: SendMessageResponse) -> Result<()> {
        self.tx
            .send(response)
            .await
            .map_err(|_| ServerError::transport("peer link closed"))
    }
}

/// Create an in-memory peer connection with the given buffer capacity.
///
/// Returns the client end plus the two server-side halves to hand to
/// [`crate::MessageServer::send_message`].
pub fn memory_link(capacity: usize) -> (MemoryPeerLink, MemoryPacketSource, MemoryPacketSink) {
    let (packet_tx, packet_rx) = mpsc::channel(capacity);
    let (response_tx, response_rx) = mpsc::channel(capacity);
    (
        MemoryPeerLink {
            packet_tx,
            response_rx,
        },
        MemoryPacketSource { rx: packet_rx },
        MemoryPacketSink { tx: response_tx },
    )
}
