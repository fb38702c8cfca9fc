//! Per-(peer, topic) acknowledgment store
//!
//! Tracks the highest sequence delivered to the registered handler for each
//! (sender, topic). Written by handler wrappers after a successful delivery,
//! read by the ack tick. The worker pool serializes events per topic, so
//! there is at most one writer per key at a time.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{NodeId, Seq, Topic, INIT_ACK};

// ----------------------------------------------------------------------------
// Ack Manager
// ----------------------------------------------------------------------------

/// Map of (peer, topic) to the last delivered sequence.
#[derive(Debug, Default)]
pub struct AckManager {
    acks: Mutex<HashMap<NodeId, HashMap<Topic, Seq>>>,
}

impl AckManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last delivered sequence for (sender, topic), or [`INIT_ACK`] if no
    /// message has been delivered yet.
    pub fn get(&self, sender: &str, topic: &str) -> Seq {
        let acks = self.acks.lock().expect("ack table lock poisoned");
        acks.get(sender)
            .and_then(|topics| topics.get(topic))
            .copied()
            .unwrap_or(INIT_ACK)
    }

    /// Record a delivered sequence for (sender, topic).
    ///
    /// Delivered sequences are contiguous per key, so the stored value never
    /// decreases.
    pub fn set(&self, sender: &str, topic: &str, seq: Seq) {
        let mut acks = self.acks.lock().expect("ack table lock poisoned");
        let entry = acks
            .entry(sender.to_owned())
            .or_default()
            .entry(topic.to_owned())
            .or_insert(INIT_ACK);
        debug_assert!(seq >= *entry, "ack regressed from {} to {}", *entry, seq);
        *entry = seq;
    }

    /// Visit every (topic, last sequence) pair recorded for a peer.
    pub fn for_each(&self, sender: &str, mut f: impl FnMut(&Topic, Seq)) {
        let acks = self.acks.lock().expect("ack table lock poisoned");
        if let Some(topics) = acks.get(sender) {
            for (topic, seq) in topics {
                f(topic, *seq);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_key_returns_init_ack() {
        let acks = AckManager::new();
        assert_eq!(acks.get("p1", "t1"), INIT_ACK);
    }

    #[test]
    fn test_set_then_get() {
        let acks = AckManager::new();
        acks.set("p1", "t1", 1);
        acks.set("p1", "t1", 2);
        acks.set("p1", "t2", 7);
        assert_eq!(acks.get("p1", "t1"), 2);
        assert_eq!(acks.get("p1", "t2"), 7);
        assert_eq!(acks.get("p2", "t1"), INIT_ACK);
    }

    #[test]
    fn test_for_each_visits_all_topics() {
        let acks = AckManager::new();
        acks.set("p1", "t1", 3);
        acks.set("p1", "t2", 5);

        let mut seen = Vec::new();
        acks.for_each("p1", |topic, seq| seen.push((topic.clone(), seq)));
        seen.sort();
        assert_eq!(seen, vec![("t1".to_string(), 3), ("t2".to_string(), 5)]);

        let mut none = Vec::new();
        acks.for_each("p2", |topic, seq| none.push((topic.clone(), seq)));
        assert!(none.is_empty());
    }
}
