//! Per-connection send-side handle
//!
//! A [`StreamHandle`] owns the bounded queue feeding a stream's send task
//! and the immutable metadata from the stream's first frame. The core loop
//! only ever enqueues without blocking; a full or closed queue is reported
//! as an error for the caller to act on.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::errors::{Result, ServerError};
use crate::protocol::wire::SendMessageResponse;
use crate::types::StreamMeta;

// ----------------------------------------------------------------------------
// Stream Handle
// ----------------------------------------------------------------------------

/// Send-side abstraction for one peer connection.
#[derive(Debug)]
pub struct StreamHandle {
    meta: StreamMeta,
    tx: Mutex<Option<mpsc::Sender<SendMessageResponse>>>,
}

impl StreamHandle {
    pub fn new(meta: StreamMeta, tx: mpsc::Sender<SendMessageResponse>) -> Self {
        Self {
            meta,
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Metadata from the stream's first frame.
    pub fn meta(&self) -> &StreamMeta {
        &self.meta
    }

    /// Enqueue a frame for the stream's send task without blocking.
    pub fn try_send(&self, response: SendMessageResponse) -> Result<()> {
        let mut guard = self.tx.lock().expect("stream handle lock poisoned");
        let Some(tx) = guard.as_ref() else {
            return Err(ServerError::SenderClosed);
        };
        match tx.try_send(response) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ServerError::SendQueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                *guard = None;
                Err(ServerError::SenderClosed)
            }
        }
    }

    /// Close the send queue, letting the send task drain and exit.
    pub fn close(&self) {
        let mut guard = self.tx.lock().expect("stream handle lock poisoned");
        *guard = None;
    }

    /// Whether the send queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .expect("stream handle lock poisoned")
            .is_none()
    }
}

// ----------------------------------------------------------------------------
// Send Rate Limiter
// ----------------------------------------------------------------------------

/// Paces server-to-peer frames to a fixed rate with a burst of one.
#[derive(Debug)]
pub(crate) struct SendRateLimiter {
    min_interval: Duration,
    next_allowed: Instant,
}

impl SendRateLimiter {
    /// Limiter allowing `rate` frames per second.
    pub(crate) fn new(rate: f64) -> Self {
        let min_interval = if rate > 0.0 {
            Duration::from_secs_f64(1.0 / rate)
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            next_allowed: Instant::now(),
        }
    }

    /// Wait until the next frame may be sent.
    pub(crate) async fn acquire(&mut self) {
        let now = Instant::now();
        if now < self.next_allowed {
            tokio::time::sleep_until(self.next_allowed).await;
        }
        self.next_allowed = self.next_allowed.max(now) + self.min_interval;
    }
}
