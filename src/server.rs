//! The message server core
//!
//! One task runs the core loop, which is the only writer to the handler
//! table, the pending buffer, and peer lifecycle state. Every mutation
//! arrives as a [`Task`] on the bounded task queue; per-stream receive
//! tasks enqueue blocking (back-propagating pressure to the sender) while
//! API surfaces enqueue non-blocking and surface congestion as an error.
//!
//! Two tasks serve each open stream: the receive task feeds the task
//! queue, the send task drains the peer's bounded send queue under a
//! per-stream rate limit. Acknowledgments are aggregated by a periodic
//! tick rather than sent per message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::acks::AckManager;
use crate::config::ServerConfig;
use crate::errors::{Result, ServerError};
use crate::metrics::{MetricsSnapshot, ServerMetrics};
use crate::peers::{Peer, PeerRegistry};
use crate::pending::{PendingBuffer, PendingEntry, TopicSenderKey};
use crate::protocol::wire::{decode_payload, error_to_response, Ack, SendMessageResponse};
use crate::stream_handle::{SendRateLimiter, StreamHandle};
use crate::transport::{PacketSink, PacketSource};
use crate::types::{MessageEntry, NodeId, RawMessageEntry, StreamMeta, Topic, INIT_ACK};
use crate::worker_pool::{EventHandle, HandlerEvent, WorkerPool};

/// Local ingress flushes its batch at this size even before the interval.
const LOCAL_BATCH_LIMIT: usize = 1024;

/// Local ingress flushes whatever it has gathered at this interval.
const LOCAL_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

// ----------------------------------------------------------------------------
// Task Queue
// ----------------------------------------------------------------------------

/// Work items serialized through the core loop.
pub(crate) enum Task {
    /// Dispatch a batch of remote and/or local messages.
    MessageBatch {
        meta: Option<StreamMeta>,
        entries: Vec<MessageEntry>,
        raw_entries: Vec<RawMessageEntry>,
    },
    /// Install a peer for a freshly accepted stream.
    RegisterPeer {
        handle: Arc<StreamHandle>,
        client_addr: String,
    },
    /// Remove a peer, optionally telling it why.
    DeregisterPeer {
        peer_id: NodeId,
        error: Option<ServerError>,
    },
    /// Install a topic handler and drain its pending messages.
    RegisterHandler {
        topic: Topic,
        handle: EventHandle,
        done: oneshot::Sender<()>,
    },
    /// Remove a topic handler, draining it gracefully off-loop.
    DeregisterHandler {
        topic: Topic,
        done: Option<oneshot::Sender<()>>,
    },
    /// Test hook: block the core loop until released.
    DebugDelay { release: oneshot::Receiver<()> },
}

/// State owned exclusively by the core loop; no lock needed.
struct CoreState {
    handlers: HashMap<Topic, EventHandle>,
    pending: PendingBuffer,
}

// ----------------------------------------------------------------------------
// Message Server
// ----------------------------------------------------------------------------

/// Topic-addressed peer-to-peer message server.
///
/// Construct with [`MessageServer::new`], wrap in an [`Arc`], and drive it
/// with [`MessageServer::run`]. Streams accepted by the transport binding
/// are served through [`MessageServer::send_message`].
pub struct MessageServer {
    server_id: NodeId,
    config: Arc<ServerConfig>,
    acks: Arc<AckManager>,
    peers: PeerRegistry,
    pool: WorkerPool,
    metrics: Arc<ServerMetrics>,
    task_tx: mpsc::Sender<Task>,
    task_rx: Mutex<Option<mpsc::Receiver<Task>>>,
    running: AtomicBool,
    close_tx: watch::Sender<bool>,
    close_rx: watch::Receiver<bool>,
}

impl MessageServer {
    /// Create a server identified as `server_id` to connecting peers.
    pub fn new(server_id: impl Into<NodeId>, config: ServerConfig) -> Self {
        let (task_tx, task_rx) = mpsc::channel(config.max_pending_task_count);
        let (close_tx, close_rx) = watch::channel(false);
        Self {
            server_id: server_id.into(),
            pool: WorkerPool::new(config.worker_pool_size),
            config: Arc::new(config),
            acks: Arc::new(AckManager::new()),
            peers: PeerRegistry::new(),
            metrics: Arc::new(ServerMetrics::default()),
            task_tx,
            task_rx: Mutex::new(Some(task_rx)),
            running: AtomicBool::new(false),
            close_tx,
            close_rx,
        }
    }

    /// The identifier peers must address their streams to.
    pub fn server_id(&self) -> &NodeId {
        &self.server_id
    }

    /// Whether [`MessageServer::run`] is currently active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Point-in-time copy of the server's activity counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Ask the server to stop. `run` returns and all waiting API calls
    /// observe [`ServerError::ServerClosed`].
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    /// Resolve once the server has been closed.
    async fn closed(&self) {
        let mut close_rx = self.close_rx.clone();
        let _ = close_rx.wait_for(|closed| *closed).await;
    }

    // ------------------------------------------------------------------------
    // Run Loop
    // ------------------------------------------------------------------------

    /// Run the server until it is closed or a fatal condition occurs.
    ///
    /// Messages arriving on `local_rx` join the dispatch path without a
    /// transport; closing that channel is terminal for the server.
    pub async fn run(
        self: Arc<Self>,
        local_rx: Option<mpsc::Receiver<RawMessageEntry>>,
    ) -> Result<()> {
        let task_rx = self
            .task_rx
            .lock()
            .expect("task queue lock poisoned")
            .take()
            .ok_or(ServerError::AlreadyRunning)?;

        self.running.store(true, Ordering::Release);
        self.pool.start();
        info!(server_id = %self.server_id, "message server running");

        let result = tokio::select! {
            core = self.run_core(task_rx) => core,
            local = self.run_local_ingress(local_rx) => local,
        };

        self.running.store(false, Ordering::Release);
        let _ = self.close_tx.send(true);
        info!(server_id = %self.server_id, "message server stopped");
        result
    }

    async fn run_core(&self, mut task_rx: mpsc::Receiver<Task>) -> Result<()> {
        let mut state = CoreState {
            handlers: HashMap::new(),
            pending: PendingBuffer::new(),
        };
        let mut ticker = tokio::time::interval(self.config.ack_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.closed() => return Ok(()),
                _ = ticker.tick() => self.tick(),
                task = task_rx.recv() => match task {
                    Some(task) => self.handle_task(&mut state, task).await,
                    None => return Ok(()),
                },
            }
        }
    }

    async fn handle_task(&self, state: &mut CoreState, task: Task) {
        match task {
            Task::MessageBatch {
                meta,
                entries,
                raw_entries,
            } => {
                for entry in raw_entries {
                    self.handle_raw_message(state, entry).await;
                }
                if let Some(meta) = meta {
                    for entry in entries {
                        self.handle_message(state, meta.clone(), entry).await;
                    }
                }
            }
            Task::RegisterPeer {
                handle,
                client_addr,
            } => {
                debug!(
                    sender_id = %handle.meta().sender_id,
                    epoch = handle.meta().epoch,
                    "register peer task"
                );
                if let Err(err) = self.register_peer(Arc::clone(&handle), &client_addr) {
                    // A rejected stream never affects other peers; the
                    // outcome travels back on the offending stream only.
                    if let Err(send_err) = handle.try_send(error_to_response(&err)) {
                        warn!(
                            error = %err,
                            send_error = %send_err,
                            "could not send registration error to peer"
                        );
                    }
                }
            }
            Task::DeregisterPeer { peer_id, error } => {
                info!(peer_id = %peer_id, "deregister peer task");
                self.deregister_peer_by_id(&peer_id, error);
            }
            Task::RegisterHandler {
                topic,
                handle,
                done,
            } => {
                self.register_handler(state, topic, handle, done).await;
            }
            Task::DeregisterHandler { topic, done } => {
                self.deregister_handler(state, topic, done);
            }
            Task::DebugDelay { release } => {
                info!("debug delay task started");
                tokio::select! {
                    _ = self.closed() => info!("debug delay task canceled"),
                    _ = release => info!("debug delay task ended"),
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Ack Tick
    // ------------------------------------------------------------------------

    /// Aggregate pending acknowledgments into at most one frame per peer.
    fn tick(&self) {
        let mut to_deregister = Vec::new();

        for peer in self.peers.snapshot() {
            let mut acks = Vec::new();
            self.acks.for_each(peer.peer_id(), |topic, last_seq| {
                acks.push(Ack {
                    topic: topic.clone(),
                    last_seq,
                });
            });
            if acks.is_empty() {
                continue;
            }

            match peer.handle().try_send(SendMessageResponse::acks(acks)) {
                Ok(()) => self.metrics.record_ack_frame(),
                Err(ServerError::SendQueueFull) => {
                    // Acks are re-aggregated next tick; nothing is lost.
                    warn!(peer_id = %peer.peer_id(), "peer send queue full, delaying acks");
                }
                Err(err) => {
                    warn!(peer_id = %peer.peer_id(), error = %err, "sending acks to peer failed");
                    to_deregister.push(peer);
                }
            }
        }

        for peer in to_deregister {
            // The stream is gone already, so no abort error is attached.
            self.deregister_peer(&peer, None);
        }
    }

    // ------------------------------------------------------------------------
    // Peer Lifecycle
    // ------------------------------------------------------------------------

    fn register_peer(&self, handle: Arc<StreamHandle>, client_addr: &str) -> Result<()> {
        let meta = handle.meta().clone();
        info!(
            sender_id = %meta.sender_id,
            sender_addr = %meta.sender_advertised_addr,
            client_addr = %client_addr,
            epoch = meta.epoch,
            "peer connection received"
        );

        let Some(existing) = self.peers.get(&meta.sender_id) else {
            let peer_count = self.peers.len();
            if peer_count >= self.config.max_peer_count {
                warn!(sender_id = %meta.sender_id, peer_count, "rejecting peer, limit reached");
                return Err(ServerError::TooManyPeers { count: peer_count });
            }
            self.peers.insert(Arc::new(Peer::new(
                meta.sender_id.clone(),
                meta.epoch,
                handle,
            )));
            return Ok(());
        };

        if existing.epoch() > meta.epoch {
            warn!(
                sender_id = %meta.sender_id,
                incoming_epoch = meta.epoch,
                current_epoch = existing.epoch(),
                "incoming connection is stale"
            );
            Err(ServerError::StaleConnection {
                peer_id: meta.sender_id,
                old_epoch: meta.epoch,
                new_epoch: existing.epoch(),
            })
        } else if existing.epoch() < meta.epoch {
            let err = ServerError::StaleConnection {
                peer_id: meta.sender_id.clone(),
                old_epoch: existing.epoch(),
                new_epoch: meta.epoch,
            };
            self.deregister_peer(&existing, Some(err));
            self.peers.insert(Arc::new(Peer::new(
                meta.sender_id.clone(),
                meta.epoch,
                handle,
            )));
            Ok(())
        } else {
            warn!(
                sender_id = %meta.sender_id,
                epoch = meta.epoch,
                "incoming connection is duplicate"
            );
            Err(ServerError::DuplicateConnection {
                peer_id: meta.sender_id,
                epoch: meta.epoch,
            })
        }
    }

    fn deregister_peer(&self, peer: &Arc<Peer>, error: Option<ServerError>) {
        info!(
            peer_id = %peer.peer_id(),
            epoch = peer.epoch(),
            error = ?error,
            "deregistering peer"
        );
        self.peers.remove(peer.peer_id());
        if let Some(err) = error {
            peer.abort(&err);
        }
    }

    fn deregister_peer_by_id(&self, peer_id: &str, error: Option<ServerError>) {
        let Some(peer) = self.peers.get(peer_id) else {
            warn!(peer_id = %peer_id, "peer not found");
            return;
        };
        self.deregister_peer(&peer, error);
    }

    /// Schedule a task to deregister a peer.
    pub fn schedule_deregister_peer_task(&self, peer_id: impl Into<NodeId>) -> Result<()> {
        self.schedule_task(Task::DeregisterPeer {
            peer_id: peer_id.into(),
            error: None,
        })
    }

    /// Block the core loop until `release` fires. Test hook.
    #[doc(hidden)]
    pub fn schedule_debug_delay(&self, release: oneshot::Receiver<()>) -> Result<()> {
        self.schedule_task(Task::DebugDelay { release })
    }

    // ------------------------------------------------------------------------
    // Handler Lifecycle
    // ------------------------------------------------------------------------

    /// Register a handler for `topic`, decoding payloads as `T`.
    ///
    /// Returns a completion signal that fires once the handler is installed
    /// and pending messages have been drained into it, plus the channel
    /// carrying the handler's first error. At most one handler may exist
    /// per topic; registering a second one is a programming error and
    /// panics on the core loop.
    pub fn add_handler<T, F>(
        &self,
        topic: impl Into<Topic>,
        callback: F,
    ) -> Result<(oneshot::Receiver<()>, mpsc::Receiver<ServerError>)>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(NodeId, T) -> Result<()> + Send + Sync + 'static,
    {
        let topic = topic.into();

        let acks = Arc::clone(&self.acks);
        let metrics = Arc::clone(&self.metrics);
        let server_id = self.server_id.clone();
        let task_tx = self.task_tx.clone();
        let local_topic = topic.clone();
        let func = Box::new(move |event: HandlerEvent| -> Result<()> {
            match event {
                HandlerEvent::Remote { meta, entry } => {
                    let last_ack = acks.get(&meta.sender_id, &entry.topic);
                    if entry.sequence <= last_ack {
                        metrics.record_repeated_message();
                        debug!(
                            sender_id = %meta.sender_id,
                            topic = %entry.topic,
                            skipped_seq = entry.sequence,
                            last_ack,
                            "skipping repeated peer message"
                        );
                        return Ok(());
                    }
                    if last_ack != INIT_ACK && entry.sequence > last_ack + 1 {
                        // A gap can only appear if this handler failed to
                        // unregister before the sender moved on. Report it
                        // instead of silently skipping.
                        let err = ServerError::DataLost {
                            topic: entry.topic.clone(),
                            expected_seq: last_ack + 1,
                        };
                        deregister_sender(&task_tx, &meta.sender_id, &err);
                        return Err(err);
                    }

                    let value: T = match decode_payload(&entry.content) {
                        Ok(value) => value,
                        Err(reason) => {
                            let err = ServerError::decode(entry.topic.clone(), reason);
                            deregister_sender(&task_tx, &meta.sender_id, &err);
                            return Err(err);
                        }
                    };
                    if let Err(err) = callback(meta.sender_id.clone(), value) {
                        deregister_sender(&task_tx, &meta.sender_id, &err);
                        return Err(err);
                    }

                    acks.set(&meta.sender_id, &entry.topic, entry.sequence);
                    Ok(())
                }
                HandlerEvent::Local { value } => match value.downcast::<T>() {
                    Ok(value) => callback(server_id.clone(), *value),
                    Err(_) => Err(ServerError::decode(
                        local_topic.clone(),
                        "local payload has unexpected type",
                    )),
                },
            }
        });

        let exit_topic = topic.clone();
        let exit_task_tx = self.task_tx.clone();
        let on_exit = Box::new(move |err: &ServerError| {
            warn!(topic = %exit_topic, error = %err, "handler exited, scheduling deregistration");
            let _ = exit_task_tx.try_send(Task::DeregisterHandler {
                topic: exit_topic.clone(),
                done: None,
            });
        });

        let (handle, err_rx) = self.pool.register(topic.clone(), func, on_exit);
        let (done_tx, done_rx) = oneshot::channel();
        self.schedule_task(Task::RegisterHandler {
            topic,
            handle,
            done: done_tx,
        })?;
        Ok((done_rx, err_rx))
    }

    /// [`MessageServer::add_handler`], waiting until the handler is
    /// installed.
    pub async fn sync_add_handler<T, F>(
        &self,
        topic: impl Into<Topic>,
        callback: F,
    ) -> Result<mpsc::Receiver<ServerError>>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(NodeId, T) -> Result<()> + Send + Sync + 'static,
    {
        let (done_rx, err_rx) = self.add_handler(topic, callback)?;
        tokio::select! {
            _ = self.closed() => Err(ServerError::ServerClosed),
            done = done_rx => done.map(|_| err_rx).map_err(|_| ServerError::ServerClosed),
        }
    }

    /// Remove the handler for `topic`. Removing an absent handler is a
    /// no-op so that callers need not track registration state.
    pub fn remove_handler(&self, topic: impl Into<Topic>) -> Result<oneshot::Receiver<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        self.schedule_task(Task::DeregisterHandler {
            topic: topic.into(),
            done: Some(done_tx),
        })?;
        Ok(done_rx)
    }

    /// [`MessageServer::remove_handler`], waiting until the handler is gone.
    pub async fn sync_remove_handler(&self, topic: impl Into<Topic>) -> Result<()> {
        let topic = topic.into();
        let done_rx = self.remove_handler(topic.clone())?;
        tokio::select! {
            _ = self.closed() => {
                debug!(topic = %topic, "server closed while a handler was being removed");
                Ok(())
            }
            _ = done_rx => Ok(()),
        }
    }

    async fn register_handler(
        &self,
        state: &mut CoreState,
        topic: Topic,
        handle: EventHandle,
        done: oneshot::Sender<()>,
    ) {
        if state.handlers.contains_key(&topic) {
            // Two live handlers would race on the ack table with undefined
            // results, so this is unrecoverable.
            panic!("duplicate handler registration for topic {topic}");
        }
        state.handlers.insert(topic.clone(), handle);
        debug!(topic = %topic, "handler registered");

        for entry in state.pending.drain_topic(&topic) {
            match entry {
                PendingEntry::Remote { meta, entry } => {
                    self.handle_message(state, meta, entry).await;
                }
                PendingEntry::Local { entry } => {
                    self.handle_raw_message(state, entry).await;
                }
            }
        }
        let _ = done.send(());
    }

    fn deregister_handler(
        &self,
        state: &mut CoreState,
        topic: Topic,
        done: Option<oneshot::Sender<()>>,
    ) {
        let Some(handle) = state.handlers.remove(&topic) else {
            // Idempotent so callers need no registration bookkeeping.
            warn!(topic = %topic, "handler not found");
            if let Some(done) = done {
                let _ = done.send(());
            }
            return;
        };

        // Draining may take up to the graceful timeout; keep it off-loop.
        let timeout = self.config.wait_unregister_handle_timeout;
        tokio::spawn(async move {
            if let Err(err) = handle.graceful_unregister(timeout).await {
                // The handler is removed regardless, only forcefully; its
                // undrained events are dropped.
                warn!(topic = %topic, error = %err, "failed to gracefully unregister handler");
            }
            debug!(topic = %topic, "handler deregistered");
            if let Some(done) = done {
                let _ = done.send(());
            }
        });
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    async fn handle_message(&self, state: &mut CoreState, meta: StreamMeta, entry: MessageEntry) {
        let CoreState { handlers, pending } = state;

        let Some(peer) = self.peers.get(&meta.sender_id) else {
            debug!(
                topic = %entry.topic,
                seq = entry.sequence,
                "message without corresponding peer"
            );
            return;
        };
        if peer.epoch() != meta.epoch || !peer.is_valid() {
            debug!(
                topic = %entry.topic,
                seq = entry.sequence,
                "dropping message from superseded stream"
            );
            return;
        }

        let topic = entry.topic.clone();
        let Some(handle) = handlers.get(&topic) else {
            let key = TopicSenderKey {
                topic: topic.clone(),
                sender_id: meta.sender_id.clone(),
            };
            let count = pending.push(key.clone(), PendingEntry::Remote { meta, entry });
            if count > self.config.max_pending_message_count_per_topic {
                warn!(topic = %topic, "topic congested, no handler has been registered");
                pending.drop_key(&key);
                self.deregister_peer(&peer, Some(ServerError::TopicCongested { topic }));
            }
            return;
        };

        if let Err(err) = handle.add_event(HandlerEvent::Remote { meta, entry }).await {
            warn!(topic = %topic, error = %err, "failed to process message due to a handler error");
            self.deregister_peer(&peer, Some(err));
        }
    }

    async fn handle_raw_message(&self, state: &mut CoreState, entry: RawMessageEntry) {
        let CoreState { handlers, pending } = state;
        let topic = entry.topic.clone();

        let Some(handle) = handlers.get(&topic) else {
            let key = TopicSenderKey {
                topic: topic.clone(),
                sender_id: self.server_id.clone(),
            };
            let count = pending.push(key.clone(), PendingEntry::Local { entry });
            if count > self.config.max_pending_message_count_per_topic {
                // Local overflow only sheds the buffer; there is no peer to
                // deregister.
                warn!(topic = %topic, "topic congested, no handler has been registered");
                pending.drop_key(&key);
            }
            return;
        };

        if let Err(err) = handle
            .add_event(HandlerEvent::Local { value: entry.value })
            .await
        {
            // Local messages have no peer to penalize; drop and move on.
            debug!(topic = %topic, error = %err, "failed to process local message");
        }
    }

    // ------------------------------------------------------------------------
    // Stream Serving
    // ------------------------------------------------------------------------

    /// Serve one accepted bidirectional stream until it ends or the server
    /// closes.
    ///
    /// The first frame must carry valid [`StreamMeta`]; on rejection the
    /// peer receives a frame explaining why and the stream ends.
    pub async fn send_message<Rx, Tx>(self: &Arc<Self>, mut source: Rx, mut sink: Tx) -> Result<()>
    where
        Rx: PacketSource,
        Tx: PacketSink,
    {
        let Some(first) = source.recv().await? else {
            return Err(ServerError::transport("stream closed before stream metadata"));
        };
        let meta = match first.meta {
            Some(meta) => meta,
            None => {
                let err = ServerError::illegal_meta("first frame carries no stream metadata");
                let _ = sink.send(error_to_response(&err)).await;
                return Err(err);
            }
        };
        if let Err(err) = self.verify_stream_meta(&meta) {
            let _ = sink.send(error_to_response(&err)).await;
            return Err(err);
        }

        let _stream_guard = self.metrics.stream_guard();
        let (send_tx, send_rx) = mpsc::channel(self.config.send_channel_size);
        let handle = Arc::new(StreamHandle::new(meta, send_tx));

        let recv_task = {
            let server = Arc::clone(self);
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                let result = server.receive_stream(source, &handle).await;
                if let Err(err) = &result {
                    warn!(
                        peer_id = %handle.meta().sender_id,
                        error = %err,
                        "peer stream receive error"
                    );
                    if let Err(send_err) = handle.try_send(error_to_response(err)) {
                        warn!(
                            error = %send_err,
                            "send queue congested, could not report stream error"
                        );
                    }
                }
                // Closing the send queue is what lets the send task exit.
                handle.close();
                result
            })
        };

        let send_task = {
            let rate = self.config.send_rate_limit_per_stream;
            let peer_id = handle.meta().sender_id.clone();
            let mut send_rx = send_rx;
            tokio::spawn(async move {
                let mut limiter = SendRateLimiter::new(rate);
                while let Some(response) = send_rx.recv().await {
                    limiter.acquire().await;
                    if let Err(err) = sink.send(response).await {
                        warn!(peer_id = %peer_id, error = %err, "sending response to peer failed");
                        return Err(err);
                    }
                }
                info!(peer_id = %peer_id, "peer stream handle closed");
                Ok(())
            })
        };

        // The transport seam is cancel-safe, so unlike a raw gRPC handler
        // this can await its subtasks; server close aborts them instead.
        let recv_abort = recv_task.abort_handle();
        let send_abort = send_task.abort_handle();
        tokio::select! {
            _ = self.closed() => {
                recv_abort.abort();
                send_abort.abort();
                Err(ServerError::ServerClosed)
            }
            outcome = async move {
                let recv_result = recv_task.await;
                let send_result = send_task.await;
                match (recv_result, send_result) {
                    (Ok(Err(err)), _) => Err(err),
                    (_, Ok(Err(err))) => Err(err),
                    _ => Ok(()),
                }
            } => outcome,
        }
    }

    async fn receive_stream<Rx: PacketSource>(
        &self,
        mut source: Rx,
        handle: &Arc<StreamHandle>,
    ) -> Result<()> {
        // Blocking enqueue: a saturated core loop back-propagates pressure
        // through the stream to the sender.
        self.schedule_task_blocking(Task::RegisterPeer {
            handle: Arc::clone(handle),
            client_addr: handle.meta().sender_advertised_addr.clone(),
        })
        .await?;

        loop {
            let Some(packet) = source.recv().await? else {
                return Ok(());
            };

            let batch_size = packet.entries.len();
            let batch_bytes = packet.wire_size();
            if batch_bytes > self.config.max_recv_msg_size {
                return Err(ServerError::transport(format!(
                    "frame of {batch_bytes} bytes exceeds limit of {}",
                    self.config.max_recv_msg_size
                )));
            }
            debug!(
                peer_id = %handle.meta().sender_id,
                num_entries = batch_size,
                "received packet"
            );
            self.metrics.record_batch(batch_size, batch_bytes);

            if batch_size > 0 {
                self.schedule_task_blocking(Task::MessageBatch {
                    meta: Some(handle.meta().clone()),
                    entries: packet.entries,
                    raw_entries: Vec::new(),
                })
                .await?;
            }
        }
    }

    fn verify_stream_meta(&self, meta: &StreamMeta) -> Result<()> {
        meta.validate().map_err(ServerError::illegal_meta)?;
        if meta.receiver_id != self.server_id {
            return Err(ServerError::ReceiverMismatch {
                expected: self.server_id.clone(),
                actual: meta.receiver_id.clone(),
            });
        }
        if !self.config.server_version.is_empty()
            && meta.client_version != self.config.server_version
        {
            return Err(ServerError::VersionMismatch {
                server: self.config.server_version.clone(),
                client: meta.client_version.clone(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Local Ingress
    // ------------------------------------------------------------------------

    async fn run_local_ingress(
        &self,
        local_rx: Option<mpsc::Receiver<RawMessageEntry>>,
    ) -> Result<()> {
        match local_rx {
            Some(local_rx) => self.receive_local_messages(local_rx).await,
            None => {
                self.closed().await;
                Ok(())
            }
        }
    }

    async fn receive_local_messages(
        &self,
        mut local_rx: mpsc::Receiver<RawMessageEntry>,
    ) -> Result<()> {
        let mut batch: Vec<RawMessageEntry> = Vec::new();
        let mut flush = tokio::time::interval(LOCAL_FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.closed() => return Ok(()),
                entry = local_rx.recv() => match entry {
                    Some(entry) => {
                        batch.push(entry);
                        if batch.len() >= LOCAL_BATCH_LIMIT {
                            self.flush_local_batch(&mut batch).await;
                        }
                    }
                    None => {
                        info!("local message channel closed, stopping server");
                        return Err(ServerError::ServerClosed);
                    }
                },
                _ = flush.tick() => self.flush_local_batch(&mut batch).await,
            }
        }
    }

    async fn flush_local_batch(&self, batch: &mut Vec<RawMessageEntry>) {
        if batch.is_empty() {
            return;
        }
        let raw_entries = std::mem::take(batch);
        let _ = self
            .schedule_task_blocking(Task::MessageBatch {
                meta: None,
                entries: Vec::new(),
                raw_entries,
            })
            .await;
    }

    // ------------------------------------------------------------------------
    // Task Scheduling
    // ------------------------------------------------------------------------

    fn schedule_task(&self, task: Task) -> Result<()> {
        match self.task_tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ServerError::TaskQueueCongested),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ServerError::ServerClosed),
        }
    }

    async fn schedule_task_blocking(&self, task: Task) -> Result<()> {
        tokio::select! {
            _ = self.closed() => Err(ServerError::ServerClosed),
            sent = self.task_tx.send(task) => sent.map_err(|_| ServerError::ServerClosed),
        }
    }
}

/// Schedule deregistration of a misbehaving sender from a handler wrapper.
///
/// Runs on a pool worker, so the enqueue must not block; a congested queue
/// only costs the peer an earlier notification, not correctness.
fn deregister_sender(task_tx: &mpsc::Sender<Task>, peer_id: &str, err: &ServerError) {
    let task = Task::DeregisterPeer {
        peer_id: peer_id.to_owned(),
        error: Some(err.clone()),
    };
    if task_tx.try_send(task).is_err() {
        warn!(peer_id = %peer_id, "task queue congested, dropping peer deregistration");
    }
}
