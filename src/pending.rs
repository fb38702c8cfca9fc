//! Pending buffer for topics with no registered handler
//!
//! Messages that arrive before a handler exists are held per
//! (topic, sender) until registration drains them, FIFO within each key.
//! The buffer is bounded; overflow handling differs for remote and local
//! senders and is decided by the server core.

use std::collections::HashMap;

use crate::types::{MessageEntry, NodeId, RawMessageEntry, StreamMeta, Topic};

// ----------------------------------------------------------------------------
// Keys and Entries
// ----------------------------------------------------------------------------

/// Buffer key: one slot per (topic, sender).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TopicSenderKey {
    pub topic: Topic,
    pub sender_id: NodeId,
}

/// A buffered message awaiting handler registration.
#[derive(Debug)]
pub(crate) enum PendingEntry {
    /// Message received from a remote stream.
    Remote {
        meta: StreamMeta,
        entry: MessageEntry,
    },
    /// Message submitted through the local ingress.
    Local { entry: RawMessageEntry },
}

// ----------------------------------------------------------------------------
// Pending Buffer
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct PendingBuffer {
    entries: HashMap<TopicSenderKey, Vec<PendingEntry>>,
}

impl PendingBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append an entry under its key and return the new count for that key.
    pub(crate) fn push(&mut self, key: TopicSenderKey, entry: PendingEntry) -> usize {
        let bucket = self.entries.entry(key).or_default();
        bucket.push(entry);
        bucket.len()
    }

    /// Drop everything buffered under a key.
    pub(crate) fn drop_key(&mut self, key: &TopicSenderKey) {
        self.entries.remove(key);
    }

    /// Remove and return all buffered entries for a topic, FIFO per key.
    pub(crate) fn drain_topic(&mut self, topic: &str) -> Vec<PendingEntry> {
        let keys: Vec<TopicSenderKey> = self
            .entries
            .keys()
            .filter(|key| key.topic == topic)
            .cloned()
            .collect();

        let mut drained = Vec::new();
        for key in keys {
            if let Some(bucket) = self.entries.remove(&key) {
                drained.extend(bucket);
            }
        }
        drained
    }
}
