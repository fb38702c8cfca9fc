//! Server configuration
//!
//! All tunables of the message server in one struct, with defaults sized
//! for metadata-volume traffic. Loading from files or the environment is
//! the embedding application's business.

use std::time::Duration;

// ----------------------------------------------------------------------------
// Server Configuration
// ----------------------------------------------------------------------------

/// Configuration for [`crate::MessageServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum entries cached per (topic, sender) while the topic has no
    /// registered handler. Overflow congests the sending peer.
    pub max_pending_message_count_per_topic: usize,
    /// Capacity of the core task queue.
    pub max_pending_task_count: usize,
    /// Capacity of the per-peer send queue.
    pub send_channel_size: usize,
    /// Interval at which acknowledgments are aggregated and sent.
    pub ack_interval: Duration,
    /// Number of workers executing topic handlers.
    pub worker_pool_size: usize,
    /// Maximum server-to-peer frame rate per stream, in frames per second.
    pub send_rate_limit_per_stream: f64,
    /// Hard cap on concurrently connected peers.
    pub max_peer_count: usize,
    /// Version gate for connecting clients. Empty disables the check.
    pub server_version: String,
    /// Per-frame byte ceiling on received packets.
    pub max_recv_msg_size: usize,
    /// Idle duration after which the transport probes the client.
    ///
    /// Applied by the transport binding, not by the server itself.
    pub keep_alive_time: Duration,
    /// How long the transport waits for a probe response before it closes
    /// the connection.
    pub keep_alive_timeout: Duration,
    /// How long to wait for a topic handler to consume its queued events
    /// before forcefully removing it.
    ///
    /// A correct handler drains quickly, as it is not expected to block on
    /// channels or I/O.
    pub wait_unregister_handle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_pending_message_count_per_topic: 256,
            max_pending_task_count: 1024,
            send_channel_size: 16,
            ack_interval: Duration::from_millis(100),
            worker_pool_size: 4,
            send_rate_limit_per_stream: 1024.0,
            max_peer_count: 1024,
            server_version: String::new(),
            max_recv_msg_size: 16 * 1024 * 1024, // 16 MiB; messages carry metadata, not row data
            keep_alive_time: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(10),
            wait_unregister_handle_timeout: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    /// Configuration with short intervals and small buffers for tests.
    pub fn testing() -> Self {
        Self {
            max_pending_message_count_per_topic: 16,
            max_pending_task_count: 64,
            send_channel_size: 8,
            ack_interval: Duration::from_millis(20),
            worker_pool_size: 2,
            send_rate_limit_per_stream: 10_000.0,
            max_peer_count: 8,
            wait_unregister_handle_timeout: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// Validate the configuration for feasibility.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_pending_message_count_per_topic == 0 {
            return Err("max_pending_message_count_per_topic cannot be zero".into());
        }
        if self.max_pending_task_count == 0 {
            return Err("max_pending_task_count cannot be zero".into());
        }
        if self.send_channel_size == 0 {
            return Err("send_channel_size cannot be zero".into());
        }
        if self.ack_interval.is_zero() {
            return Err("ack_interval cannot be zero".into());
        }
        if self.worker_pool_size == 0 {
            return Err("worker_pool_size cannot be zero".into());
        }
        if self.send_rate_limit_per_stream <= 0.0 {
            return Err("send_rate_limit_per_stream must be positive".into());
        }
        if self.max_peer_count == 0 {
            return Err("max_peer_count cannot be zero".into());
        }
        if self.max_recv_msg_size == 0 {
            return Err("max_recv_msg_size cannot be zero".into());
        }
        Ok(())
    }
}
