//! Integration tests for the message server
//!
//! Each test drives the server through the in-memory peer link, exactly as
//! a transport binding would: one metadata frame, then batches of entries,
//! with acknowledgment frames flowing back.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::timeout;

use peermux::{
    encode_payload, memory_link, ExitReason, MemoryPeerLink, MessageEntry, MessagePacket,
    MessageServer, NodeId, RawMessageEntry, SendMessageResponse, ServerConfig, ServerError,
    StreamMeta,
};

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

const SERVER_ID: &str = "server-1";

fn test_meta(sender: &str, receiver: &str, epoch: i64) -> StreamMeta {
    StreamMeta {
        sender_id: sender.into(),
        receiver_id: receiver.into(),
        sender_advertised_addr: format!("10.0.0.1:{sender}"),
        epoch,
        client_version: String::new(),
    }
}

fn text_entry(topic: &str, sequence: i64, text: &str) -> MessageEntry {
    MessageEntry {
        topic: topic.into(),
        sequence,
        content: encode_payload(&text.to_string()).expect("payload encodes"),
    }
}

fn start_server(config: ServerConfig) -> Arc<MessageServer> {
    let server = Arc::new(MessageServer::new(SERVER_ID, config));
    tokio::spawn(Arc::clone(&server).run(None));
    server
}

/// Open a stream for `sender` and deliver its metadata frame.
async fn connect(server: &Arc<MessageServer>, sender: &str, epoch: i64) -> MemoryPeerLink {
    let (client, source, sink) = memory_link(32);
    let server = Arc::clone(server);
    tokio::spawn(async move {
        let _ = server.send_message(source, sink).await;
    });
    client
        .send_packet(MessagePacket {
            meta: Some(test_meta(sender, SERVER_ID, epoch)),
            entries: Vec::new(),
        })
        .await
        .expect("metadata frame accepted");
    client
}

async fn send_entries(client: &MemoryPeerLink, entries: Vec<MessageEntry>) {
    client
        .send_packet(MessagePacket {
            meta: None,
            entries,
        })
        .await
        .expect("entry frame accepted");
}

/// Register a handler that forwards (sender, text) pairs to a channel.
async fn add_collector(
    server: &Arc<MessageServer>,
    topic: &str,
) -> (
    mpsc::UnboundedReceiver<(NodeId, String)>,
    mpsc::Receiver<ServerError>,
) {
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let err_rx = server
        .sync_add_handler(topic, move |sender: NodeId, text: String| {
            seen_tx
                .send((sender, text))
                .map_err(|_| ServerError::handler_failed("collector", "collector closed"))
        })
        .await
        .expect("handler registers");
    (seen_rx, err_rx)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn recv_frame_matching(
    client: &mut MemoryPeerLink,
    mut pred: impl FnMut(&SendMessageResponse) -> bool,
) -> SendMessageResponse {
    timeout(Duration::from_secs(2), async {
        loop {
            let frame = client
                .recv_response()
                .await
                .expect("stream closed before expected frame");
            if pred(&frame) {
                return frame;
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

async fn recv_collected(rx: &mut mpsc::UnboundedReceiver<(NodeId, String)>) -> (NodeId, String) {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for handler invocation")
        .expect("collector open")
}

// ----------------------------------------------------------------------------
// Delivery and Acknowledgment
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_deliver_and_ack() {
    let server = start_server(ServerConfig::testing());
    let (mut seen, _err_rx) = add_collector(&server, "t1").await;

    let mut client = connect(&server, "p1", 1).await;
    send_entries(
        &client,
        vec![text_entry("t1", 1, "a"), text_entry("t1", 2, "b")],
    )
    .await;

    assert_eq!(recv_collected(&mut seen).await, ("p1".to_string(), "a".to_string()));
    assert_eq!(recv_collected(&mut seen).await, ("p1".to_string(), "b".to_string()));

    let frame = recv_frame_matching(&mut client, |frame| !frame.acks.is_empty()).await;
    assert_eq!(frame.exit_reason, ExitReason::Ok);
    assert_eq!(frame.acks.len(), 1);
    assert_eq!(frame.acks[0].topic, "t1");
    assert_eq!(frame.acks[0].last_seq, 2);
}

#[tokio::test]
async fn test_duplicate_messages_are_suppressed() {
    let server = start_server(ServerConfig::testing());
    let (mut seen, _err_rx) = add_collector(&server, "t1").await;

    let mut client = connect(&server, "p1", 1).await;
    send_entries(
        &client,
        vec![text_entry("t1", 1, "a"), text_entry("t1", 2, "b")],
    )
    .await;
    recv_collected(&mut seen).await;
    recv_collected(&mut seen).await;

    // Replaying an acknowledged sequence must not reach the handler.
    send_entries(&client, vec![text_entry("t1", 2, "b")]).await;
    wait_until(|| server.metrics().repeated_messages == 1).await;
    assert!(seen.try_recv().is_err());

    // The acknowledgment still reports the old high-water mark.
    let frame = recv_frame_matching(&mut client, |frame| !frame.acks.is_empty()).await;
    assert_eq!(frame.acks[0].last_seq, 2);
}

#[tokio::test]
async fn test_round_trip_delivers_every_sequence_once() {
    let server = start_server(ServerConfig::testing());
    let (mut seen, _err_rx) = add_collector(&server, "t1").await;

    let mut client = connect(&server, "p1", 1).await;
    for sequence in 1..=20 {
        send_entries(
            &client,
            vec![text_entry("t1", sequence, &format!("m{sequence}"))],
        )
        .await;
    }

    for sequence in 1..=20 {
        let (_, text) = recv_collected(&mut seen).await;
        assert_eq!(text, format!("m{sequence}"));
    }

    let frame =
        recv_frame_matching(&mut client, |frame| frame.acks.iter().any(|a| a.last_seq == 20))
            .await;
    assert_eq!(frame.acks[0].topic, "t1");
}

// ----------------------------------------------------------------------------
// Sequence Gaps
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_sequence_gap_reports_data_loss() {
    let server = start_server(ServerConfig::testing());
    let (mut seen, mut err_rx) = add_collector(&server, "t1").await;

    let mut client = connect(&server, "p1", 1).await;
    send_entries(
        &client,
        vec![text_entry("t1", 1, "a"), text_entry("t1", 2, "b")],
    )
    .await;
    recv_collected(&mut seen).await;
    recv_collected(&mut seen).await;

    // Sequence 3 never arrives; the gap is data loss, not a skip.
    send_entries(&client, vec![text_entry("t1", 4, "d")]).await;

    let reported = timeout(Duration::from_secs(2), err_rx.recv())
        .await
        .expect("handler error expected")
        .expect("error channel open");
    assert!(matches!(
        reported,
        ServerError::DataLost {
            ref topic,
            expected_seq: 3,
        } if topic == "t1"
    ));

    let frame =
        recv_frame_matching(&mut client, |frame| frame.exit_reason == ExitReason::Unknown).await;
    assert!(frame.error_message.contains("t1"));
    assert!(frame.error_message.contains('3'));
    assert!(seen.try_recv().is_err());
}

// ----------------------------------------------------------------------------
// Epoch Arbitration
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_epoch_preemption_supersedes_old_stream() {
    let server = start_server(ServerConfig::testing());
    let (mut seen, _err_rx) = add_collector(&server, "t1").await;

    let mut old_client = connect(&server, "p1", 1).await;
    send_entries(&old_client, vec![text_entry("t1", 1, "a")]).await;
    recv_collected(&mut seen).await;

    // Reconnect with a larger epoch while the old stream is still open.
    let new_client = connect(&server, "p1", 2).await;
    let frame = recv_frame_matching(&mut old_client, |frame| {
        frame.exit_reason == ExitReason::StaleConnection
    })
    .await;
    assert!(frame.error_message.contains("epoch 1"));
    assert!(frame.error_message.contains("epoch 2"));

    // In-flight messages from the superseded stream are dropped.
    send_entries(&old_client, vec![text_entry("t1", 2, "stale")]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen.try_recv().is_err());

    // The winning stream continues the sequence from the same ack state.
    send_entries(&new_client, vec![text_entry("t1", 2, "b")]).await;
    assert_eq!(recv_collected(&mut seen).await, ("p1".to_string(), "b".to_string()));
}

#[tokio::test]
async fn test_stale_epoch_is_rejected() {
    let server = start_server(ServerConfig::testing());
    let (mut seen, _err_rx) = add_collector(&server, "t1").await;

    let current = connect(&server, "p1", 5).await;
    send_entries(&current, vec![text_entry("t1", 1, "a")]).await;
    recv_collected(&mut seen).await;

    let mut stale = connect(&server, "p1", 4).await;
    let frame = recv_frame_matching(&mut stale, |frame| {
        frame.exit_reason == ExitReason::StaleConnection
    })
    .await;
    assert!(frame.error_message.contains("epoch 4"));
    assert!(frame.error_message.contains("epoch 5"));
}

#[tokio::test]
async fn test_duplicate_epoch_is_rejected() {
    let server = start_server(ServerConfig::testing());
    let (mut seen, _err_rx) = add_collector(&server, "t1").await;

    let first = connect(&server, "p1", 3).await;
    send_entries(&first, vec![text_entry("t1", 1, "a")]).await;
    recv_collected(&mut seen).await;

    let mut duplicate = connect(&server, "p1", 3).await;
    let frame =
        recv_frame_matching(&mut duplicate, |frame| frame.exit_reason == ExitReason::Unknown)
            .await;
    assert!(frame.error_message.contains("duplicate"));
}

// ----------------------------------------------------------------------------
// Pending Buffer
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_pending_messages_drain_into_new_handler() {
    let server = start_server(ServerConfig::testing());
    let client = connect(&server, "p1", 1).await;

    // No handler for t2 yet; both messages are buffered.
    send_entries(
        &client,
        vec![text_entry("t2", 1, "x"), text_entry("t2", 2, "y")],
    )
    .await;
    wait_until(|| server.metrics().messages_received == 2).await;

    let (mut seen, _err_rx) = add_collector(&server, "t2").await;
    assert_eq!(recv_collected(&mut seen).await, ("p1".to_string(), "x".to_string()));
    assert_eq!(recv_collected(&mut seen).await, ("p1".to_string(), "y".to_string()));
}

#[tokio::test]
async fn test_pending_overflow_congests_the_peer() {
    let mut config = ServerConfig::testing();
    config.max_pending_message_count_per_topic = 4;
    let server = start_server(config);

    let mut client = connect(&server, "p1", 1).await;
    let entries: Vec<MessageEntry> = (1..=5)
        .map(|sequence| text_entry("t3", sequence, "overflow"))
        .collect();
    send_entries(&client, entries).await;

    let frame =
        recv_frame_matching(&mut client, |frame| frame.exit_reason == ExitReason::Congested)
            .await;
    assert!(frame.error_message.contains("t3"));

    // The buffered backlog is gone: a late handler sees none of it.
    let (mut seen, _err_rx) = add_collector(&server, "t3").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen.try_recv().is_err());
}

// ----------------------------------------------------------------------------
// Stream Validation
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_receiver_mismatch_is_rejected() {
    let server = start_server(ServerConfig::testing());

    let (client, source, sink) = memory_link(8);
    let serve = Arc::clone(&server);
    let serving = tokio::spawn(async move { serve.send_message(source, sink).await });

    client
        .send_packet(MessagePacket {
            meta: Some(test_meta("p1", "some-other-server", 1)),
            entries: Vec::new(),
        })
        .await
        .expect("metadata frame accepted");

    let mut client = client;
    let frame = recv_frame_matching(&mut client, |_| true).await;
    assert_eq!(frame.exit_reason, ExitReason::ReceiverMismatch);

    let result = serving.await.expect("serving task completes");
    assert!(matches!(result, Err(ServerError::ReceiverMismatch { .. })));
}

#[tokio::test]
async fn test_missing_meta_is_rejected() {
    let server = start_server(ServerConfig::testing());

    let (client, source, sink) = memory_link(8);
    let serve = Arc::clone(&server);
    tokio::spawn(async move { serve.send_message(source, sink).await });

    client
        .send_packet(MessagePacket {
            meta: None,
            entries: vec![text_entry("t1", 1, "a")],
        })
        .await
        .expect("frame accepted");

    let mut client = client;
    let frame = recv_frame_matching(&mut client, |_| true).await;
    assert_eq!(frame.exit_reason, ExitReason::Unknown);
    assert!(frame.error_message.contains("metadata"));
}

// ----------------------------------------------------------------------------
// Task Queue Back-Pressure
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_saturated_task_queue_reports_congestion() {
    let mut config = ServerConfig::testing();
    config.max_pending_task_count = 2;
    let server = start_server(config);

    // Park the core loop so nothing drains the queue.
    let (release_tx, release_rx) = oneshot::channel();
    server.schedule_debug_delay(release_rx).expect("delay scheduled");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Fill the queue to capacity, then one more must fail synchronously.
    server.schedule_deregister_peer_task("p1").expect("first fits");
    server.schedule_deregister_peer_task("p2").expect("second fits");
    let err = server.schedule_deregister_peer_task("p3").unwrap_err();
    assert!(matches!(err, ServerError::TaskQueueCongested));

    let _ = release_tx.send(());
}

// ----------------------------------------------------------------------------
// Handler Lifecycle
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_remove_handler_is_idempotent() {
    let server = start_server(ServerConfig::testing());
    let (_seen, _err_rx) = add_collector(&server, "t1").await;

    server.sync_remove_handler("t1").await.expect("removal succeeds");
    server
        .sync_remove_handler("t1")
        .await
        .expect("second removal is a no-op");
    server
        .sync_remove_handler("never-registered")
        .await
        .expect("unknown topic is a no-op");
}

#[tokio::test]
async fn test_removed_handler_buffers_new_messages() {
    let server = start_server(ServerConfig::testing());
    let (mut seen, _err_rx) = add_collector(&server, "t1").await;

    let client = connect(&server, "p1", 1).await;
    send_entries(&client, vec![text_entry("t1", 1, "a")]).await;
    recv_collected(&mut seen).await;

    server.sync_remove_handler("t1").await.expect("removal succeeds");
    send_entries(&client, vec![text_entry("t1", 2, "b")]).await;
    wait_until(|| server.metrics().messages_received == 2).await;
    assert!(seen.try_recv().is_err());

    // A re-registered handler picks the buffered message up.
    let (mut seen_again, _err_rx) = add_collector(&server, "t1").await;
    assert_eq!(
        recv_collected(&mut seen_again).await,
        ("p1".to_string(), "b".to_string())
    );
}

#[tokio::test]
async fn test_failing_handler_deregisters_peer_and_itself() {
    let server = start_server(ServerConfig::testing());
    let mut err_rx = server
        .sync_add_handler("t1", |_sender: NodeId, _text: String| {
            Err(ServerError::handler_failed("t1", "refusing every message"))
        })
        .await
        .expect("handler registers");

    let mut client = connect(&server, "p1", 1).await;
    send_entries(&client, vec![text_entry("t1", 1, "a")]).await;

    let reported = timeout(Duration::from_secs(2), err_rx.recv())
        .await
        .expect("handler error expected")
        .expect("error channel open");
    assert!(matches!(reported, ServerError::HandlerFailed { .. }));

    let frame =
        recv_frame_matching(&mut client, |frame| frame.exit_reason == ExitReason::Unknown).await;
    assert!(frame.error_message.contains("refusing every message"));
}

// ----------------------------------------------------------------------------
// Local Ingress
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_local_messages_reach_handlers() {
    let server = Arc::new(MessageServer::new(SERVER_ID, ServerConfig::testing()));
    let (local_tx, local_rx) = mpsc::channel(16);
    let running = tokio::spawn(Arc::clone(&server).run(Some(local_rx)));

    let (mut seen, _err_rx) = add_collector(&server, "t-local").await;
    local_tx
        .send(RawMessageEntry::new("t-local", "from inside".to_string()))
        .await
        .expect("local entry accepted");

    // Local messages are attributed to the server itself.
    assert_eq!(
        recv_collected(&mut seen).await,
        (SERVER_ID.to_string(), "from inside".to_string())
    );

    // Closing the local channel shuts the server down.
    drop(local_tx);
    let result = timeout(Duration::from_secs(2), running)
        .await
        .expect("run returns")
        .expect("run task completes");
    assert!(matches!(result, Err(ServerError::ServerClosed)));
    assert!(!server.is_running());
}

#[tokio::test]
async fn test_local_messages_buffer_until_handler_registers() {
    let server = Arc::new(MessageServer::new(SERVER_ID, ServerConfig::testing()));
    let (local_tx, local_rx) = mpsc::channel(16);
    tokio::spawn(Arc::clone(&server).run(Some(local_rx)));

    local_tx
        .send(RawMessageEntry::new("t-local", "early".to_string()))
        .await
        .expect("local entry accepted");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (mut seen, _err_rx) = add_collector(&server, "t-local").await;
    assert_eq!(
        recv_collected(&mut seen).await,
        (SERVER_ID.to_string(), "early".to_string())
    );
}

// ----------------------------------------------------------------------------
// Server Lifecycle
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_close_stops_run_and_fails_waiting_calls() {
    let server = Arc::new(MessageServer::new(SERVER_ID, ServerConfig::testing()));
    let running = tokio::spawn(Arc::clone(&server).run(None));
    wait_until(|| server.is_running()).await;

    server.close();
    let result = timeout(Duration::from_secs(2), running)
        .await
        .expect("run returns")
        .expect("run task completes");
    assert!(result.is_ok());
    assert!(!server.is_running());

    let outcome = server
        .sync_add_handler("t1", |_sender: NodeId, _text: String| Ok(()))
        .await;
    assert!(matches!(outcome, Err(ServerError::ServerClosed)));
}
