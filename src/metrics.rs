//! In-process counters for server activity
//!
//! Plain atomics, readable from tests and from whatever exporter the
//! embedding application wires up. No exporter lives in this crate.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

// ----------------------------------------------------------------------------
// Server Metrics
// ----------------------------------------------------------------------------

/// Counters tracking server activity.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    streams_active: AtomicI64,
    batches_received: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    repeated_messages: AtomicU64,
    ack_frames_sent: AtomicU64,
}

impl ServerMetrics {
    pub(crate) fn record_batch(&self, entries: usize, bytes: usize) {
        self.batches_received.fetch_add(1, Ordering::Relaxed);
        self.messages_received
            .fetch_add(entries as u64, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_repeated_message(&self) {
        self.repeated_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ack_frame(&self) {
        self.ack_frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stream_guard(self: &Arc<Self>) -> ActiveStreamGuard {
        self.streams_active.fetch_add(1, Ordering::Relaxed);
        ActiveStreamGuard {
            metrics: Arc::clone(self),
        }
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            streams_active: self.streams_active.load(Ordering::Relaxed),
            batches_received: self.batches_received.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            repeated_messages: self.repeated_messages.load(Ordering::Relaxed),
            ack_frames_sent: self.ack_frames_sent.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active-stream gauge when a stream ends, however it ends.
#[derive(Debug)]
pub(crate) struct ActiveStreamGuard {
    metrics: Arc<ServerMetrics>,
}

impl Drop for ActiveStreamGuard {
    fn drop(&mut self) {
        self.metrics.streams_active.fetch_sub(1, Ordering::Relaxed);
    }
}

// ----------------------------------------------------------------------------
// Snapshot
// ----------------------------------------------------------------------------

/// Point-in-time copy of the server counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Streams currently open.
    pub streams_active: i64,
    /// Packets received across all streams.
    pub batches_received: u64,
    /// Message entries received across all streams.
    pub messages_received: u64,
    /// Payload bytes received across all streams.
    pub bytes_received: u64,
    /// Messages dropped because their sequence was already acknowledged.
    pub repeated_messages: u64,
    /// Acknowledgment frames handed to per-peer send queues.
    pub ack_frames_sent: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Arc::new(ServerMetrics::default());
        metrics.record_batch(3, 120);
        metrics.record_batch(1, 8);
        metrics.record_repeated_message();
        metrics.record_ack_frame();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches_received, 2);
        assert_eq!(snapshot.messages_received, 4);
        assert_eq!(snapshot.bytes_received, 128);
        assert_eq!(snapshot.repeated_messages, 1);
        assert_eq!(snapshot.ack_frames_sent, 1);
    }

    #[test]
    fn test_stream_guard_tracks_active_streams() {
        let metrics = Arc::new(ServerMetrics::default());
        let guard = metrics.stream_guard();
        assert_eq!(metrics.snapshot().streams_active, 1);
        drop(guard);
        assert_eq!(metrics.snapshot().streams_active, 0);
    }
}
