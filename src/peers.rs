//! Connected-peer registry
//!
//! Peers are installed and removed only from the server's core loop; the
//! registry lock exists so that the ack tick and stream tasks can read a
//! consistent snapshot. The lock is never held across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, error, warn};

use crate::errors::ServerError;
use crate::protocol::wire::error_to_response;
use crate::stream_handle::StreamHandle;
use crate::types::{Epoch, NodeId};

// ----------------------------------------------------------------------------
// Peer
// ----------------------------------------------------------------------------

/// One connected peer, bound to a single stream for its lifetime.
#[derive(Debug)]
pub struct Peer {
    peer_id: NodeId,
    epoch: Epoch,
    handle: Arc<StreamHandle>,
    /// Cleared by [`Peer::abort`]. Dispatch drops messages from peers that
    /// are no longer valid.
    valid: AtomicBool,
}

impl Peer {
    pub fn new(peer_id: NodeId, epoch: Epoch, handle: Arc<StreamHandle>) -> Self {
        Self {
            peer_id,
            epoch,
            handle,
            valid: AtomicBool::new(true),
        }
    }

    pub fn peer_id(&self) -> &NodeId {
        &self.peer_id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn handle(&self) -> &Arc<StreamHandle> {
        &self.handle
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Tell the peer why it is being dropped and mark it invalid.
    ///
    /// Calling this on an already-invalid peer is a double-deregistration
    /// bug in the caller.
    pub fn abort(&self, err: &ServerError) {
        if !self.is_valid() {
            if cfg!(debug_assertions) {
                panic!("aborting invalid peer {}", self.peer_id);
            }
            error!(peer_id = %self.peer_id, "aborting invalid peer");
            return;
        }
        self.valid.store(false, Ordering::Release);

        if let Err(send_err) = self.handle.try_send(error_to_response(err)) {
            warn!(
                peer_id = %self.peer_id,
                error = %err,
                send_error = %send_err,
                "could not send error to peer"
            );
            return;
        }
        debug!(peer_id = %self.peer_id, error = %err, "sent error to peer");
    }
}

// ----------------------------------------------------------------------------
// Peer Registry
// ----------------------------------------------------------------------------

/// All currently connected peers, keyed by node id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<NodeId, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<Peer>> {
        let peers = self.peers.read().expect("peer registry lock poisoned");
        peers.get(peer_id).cloned()
    }

    pub fn insert(&self, peer: Arc<Peer>) {
        let mut peers = self.peers.write().expect("peer registry lock poisoned");
        peers.insert(peer.peer_id().clone(), peer);
    }

    pub fn remove(&self, peer_id: &str) -> Option<Arc<Peer>> {
        let mut peers = self.peers.write().expect("peer registry lock poisoned");
        peers.remove(peer_id)
    }

    pub fn len(&self) -> usize {
        let peers = self.peers.read().expect("peer registry lock poisoned");
        peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy out the current peer set so callers can iterate without holding
    /// the lock.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        let peers = self.peers.read().expect("peer registry lock poisoned");
        peers.values().cloned().collect()
    }
}
