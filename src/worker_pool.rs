//! Bounded worker pool executing topic handlers
//!
//! Each registered handler is pinned to one worker, so its events run
//! serially in submission order. A handler that returns an error stops
//! processing: the error is recorded, surfaced on the handler's error
//! channel, and the exit hook fires so the server can schedule
//! deregistration. Graceful unregistration drains queued events within a
//! bound; on timeout the remaining events are dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::errors::{Result, ServerError};
use crate::types::{MessageEntry, StreamMeta, Topic};

/// Queue depth per worker; submissions block once a worker falls this far
/// behind, back-pressuring the dispatch path.
const WORKER_QUEUE_CAPACITY: usize = 1024;

// ----------------------------------------------------------------------------
// Handler Events
// ----------------------------------------------------------------------------

/// One unit of work for a topic handler.
pub(crate) enum HandlerEvent {
    /// Message received from a remote stream, still encoded.
    Remote {
        meta: StreamMeta,
        entry: MessageEntry,
    },
    /// Typed value submitted through the local ingress.
    Local {
        value: Box<dyn std::any::Any + Send>,
    },
}

type HandlerFunc = Box<dyn Fn(HandlerEvent) -> Result<()> + Send + Sync>;
type ExitFunc = Box<dyn Fn(&ServerError) + Send + Sync>;

// ----------------------------------------------------------------------------
// Handle State
// ----------------------------------------------------------------------------

struct HandleState {
    topic: Topic,
    func: HandlerFunc,
    on_exit: ExitFunc,
    /// First error the handler returned; set once, never cleared.
    failed: Mutex<Option<ServerError>>,
    /// Set when unregistration starts; rejects new submissions.
    unregistered: AtomicBool,
    /// Set on forceful unregistration; queued events are skipped.
    cancelled: AtomicBool,
    /// Events submitted but not yet finished by a worker.
    queued: AtomicUsize,
    drained: Notify,
    err_tx: mpsc::Sender<ServerError>,
}

impl HandleState {
    fn first_error(&self) -> Option<ServerError> {
        self.failed
            .lock()
            .expect("handler state lock poisoned")
            .clone()
    }

    fn record_error(&self, err: &ServerError) {
        let mut failed = self.failed.lock().expect("handler state lock poisoned");
        if failed.is_none() {
            *failed = Some(err.clone());
        }
    }

    fn finish_one(&self) {
        if self.queued.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

impl std::fmt::Debug for HandleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleState")
            .field("topic", &self.topic)
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Event Handle
// ----------------------------------------------------------------------------

/// Submission side of one registered topic handler.
#[derive(Debug)]
pub(crate) struct EventHandle {
    state: Arc<HandleState>,
    worker_tx: mpsc::Sender<Job>,
}

impl EventHandle {
    /// Submit an event for serial execution on the handler's worker.
    ///
    /// Blocks while the worker queue is full. Fails once the handler has
    /// errored or unregistration has started.
    pub(crate) async fn add_event(&self, event: HandlerEvent) -> Result<()> {
        if let Some(err) = self.state.first_error() {
            return Err(err);
        }
        if self.state.unregistered.load(Ordering::Acquire) {
            return Err(ServerError::handler_failed(
                self.state.topic.clone(),
                "handler is unregistering",
            ));
        }

        self.state.queued.fetch_add(1, Ordering::AcqRel);
        let job = Job {
            state: Arc::clone(&self.state),
            event,
        };
        if self.worker_tx.send(job).await.is_err() {
            self.state.finish_one();
            return Err(ServerError::ServerClosed);
        }
        Ok(())
    }

    /// Stop accepting events and wait for queued ones to drain.
    ///
    /// On timeout the handler is removed anyway and its queued events are
    /// dropped, not returned to any buffer.
    pub(crate) async fn graceful_unregister(&self, timeout: Duration) -> Result<()> {
        self.state.unregistered.store(true, Ordering::Release);

        let drained = async {
            loop {
                let notified = self.state.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.state.queued.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, drained).await {
            Ok(()) => Ok(()),
            Err(_) => {
                self.state.cancelled.store(true, Ordering::Release);
                Err(ServerError::UnregisterTimeout {
                    topic: self.state.topic.clone(),
                })
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Worker Pool
// ----------------------------------------------------------------------------

struct Job {
    state: Arc<HandleState>,
    event: HandlerEvent,
}

/// Fixed set of workers that topic handlers are pinned to.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    workers: Vec<mpsc::Sender<Job>>,
    receivers: Mutex<Option<Vec<mpsc::Receiver<Job>>>>,
    next: AtomicUsize,
}

impl WorkerPool {
    pub(crate) fn new(size: usize) -> Self {
        let mut workers = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
            workers.push(tx);
            receivers.push(rx);
        }
        Self {
            workers,
            receivers: Mutex::new(Some(receivers)),
            next: AtomicUsize::new(0),
        }
    }

    /// Spawn the worker tasks. Events submitted earlier start executing now.
    ///
    /// Workers exit once every handle pinned to them has been dropped.
    pub(crate) fn start(&self) {
        let receivers = self
            .receivers
            .lock()
            .expect("worker pool lock poisoned")
            .take();
        let Some(receivers) = receivers else {
            return; // already started
        };
        for rx in receivers {
            tokio::spawn(worker_loop(rx));
        }
    }

    /// Register a handler, pinning it to a worker round-robin.
    ///
    /// Returns the submission handle and the channel carrying the handler's
    /// first error.
    pub(crate) fn register(
        &self,
        topic: Topic,
        func: HandlerFunc,
        on_exit: ExitFunc,
    ) -> (EventHandle, mpsc::Receiver<ServerError>) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let (err_tx, err_rx) = mpsc::channel(1);
        let state = Arc::new(HandleState {
            topic,
            func,
            on_exit,
            failed: Mutex::new(None),
            unregistered: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
            drained: Notify::new(),
            err_tx,
        });
        let handle = EventHandle {
            state,
            worker_tx: self.workers[index].clone(),
        };
        (handle, err_rx)
    }
}

async fn worker_loop(mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        let state = job.state;
        let skip = state.cancelled.load(Ordering::Acquire) || state.first_error().is_some();
        if skip {
            debug!(topic = %state.topic, "skipping event for stopped handler");
        } else if let Err(err) = run_handler(&state, job.event) {
            warn!(topic = %state.topic, error = %err, "topic handler returned error");
            state.record_error(&err);
            let _ = state.err_tx.try_send(err.clone());
            (state.on_exit)(&err);
        }
        state.finish_one();
    }
}

/// Run one handler invocation, containing panics so a faulty handler takes
/// down only itself, never its worker.
fn run_handler(state: &HandleState, event: HandlerEvent) -> Result<()> {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    match catch_unwind(AssertUnwindSafe(|| (state.func)(event))) {
        Ok(result) => result,
        Err(panic_info) => {
            let reason = if let Some(s) = panic_info.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "handler panicked".to_string()
            };
            Err(ServerError::handler_failed(
                state.topic.clone(),
                format!("panic: {reason}"),
            ))
        }
    }
}
