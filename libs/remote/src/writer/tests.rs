//! Endpoint writer state machine tests

use super::*;
use crate::backoff::RetryBackoff;
use crate::protocol::{ConnectResponse, MessageBatch, Pid};
use crate::registry::DeadLetterResponse;
use crate::serialization::BINCODE_SERIALIZER_ID;
use crate::test_utils::{
    drain_events, test_config, test_system, DuplexConnector, FailingConnector, RecordingDispatcher, TestMessage,
};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const LOCAL: &str = "node-a:1";
const REMOTE: &str = "node-b:2";
const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    writer: EndpointWriter,
    handle: WriterHandle,
    system: SystemHandle,
    dispatcher: Arc<RecordingDispatcher>,
}

fn fixture(connector: Arc<dyn Connector>, config: RemoteConfig) -> Fixture {
    let (system, dispatcher) = test_system("sys-a");
    system.registry().set_address(LOCAL);
    let config = Arc::new(config);
    let backoff = config.backoff_policy();
    let (writer, handle) = EndpointWriter::new(REMOTE, system.clone(), config, connector, backoff);
    Fixture {
        writer,
        handle,
        system,
        dispatcher,
    }
}

fn message(text: &str) -> DeliverRequest {
    DeliverRequest::new(
        Pid::new(REMOTE, "echo"),
        Arc::new(TestMessage::new(text)),
        BINCODE_SERIALIZER_ID,
    )
}

fn client(id: &str) -> Pid {
    Pid::new(LOCAL, id)
}

fn text_of(data: &[u8]) -> String {
    bincode::deserialize::<TestMessage>(data).unwrap().text
}

/// Accept one dial and complete the handshake as the remote side
async fn accept_handshake(peers: &mut UnboundedReceiver<Connection>) -> Connection {
    let mut conn = timeout(WAIT, peers.recv()).await.unwrap().unwrap();
    match conn.source.recv().await.unwrap() {
        Some(RemoteMessage::ConnectRequest(request)) => {
            assert_eq!(request.system_id, "sys-a");
            assert_eq!(request.address, LOCAL);
        }
        other => panic!("Expected ConnectRequest, got {:?}", other),
    }
    conn.sink
        .send(&RemoteMessage::ConnectResponse(ConnectResponse {
            member_id: "sys-b".to_string(),
            blocked: false,
        }))
        .await
        .unwrap();
    conn
}

async fn next_batch(conn: &mut Connection) -> MessageBatch {
    match timeout(WAIT, conn.source.recv()).await.unwrap().unwrap() {
        Some(RemoteMessage::MessageBatch(batch)) => batch,
        other => panic!("Expected MessageBatch, got {:?}", other),
    }
}

fn count(events: &[RemoteEvent], predicate: impl Fn(&RemoteEvent) -> bool) -> usize {
    events.iter().filter(|e| predicate(e)).count()
}

#[tokio::test]
async fn test_retry_bound_publishes_single_terminated() {
    let connector = Arc::new(FailingConnector::new());
    let f = fixture(connector.clone(), test_config().with_max_retry_count(3));
    let mut events = f.system.event_stream().subscribe();

    let exit = f.writer.run().await;

    assert!(matches!(exit, WriterExit::Stopped));
    assert_eq!(connector.attempts(), 3);
    let events = drain_events(&mut events);
    assert_eq!(count(&events, |e| e.is_terminated()), 1);
    assert_eq!(count(&events, |e| matches!(e, RemoteEvent::EndpointConnected { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_attempts_wait_for_backoff() {
    let connector = Arc::new(FailingConnector::new());
    let config = test_config()
        .with_max_retry_count(3)
        .with_retry_backoff(RetryBackoff::Fixed { delay_ms: 100 });
    let f = fixture(connector.clone(), config);

    let started = tokio::time::Instant::now();
    assert!(matches!(f.writer.run().await, WriterExit::Stopped));

    // Two waits between three attempts, none after the last
    assert_eq!(connector.attempts(), 3);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(300), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_start_delay_holds_first_attempt() {
    let connector = Arc::new(FailingConnector::new());
    let f = fixture(connector.clone(), test_config().with_max_retry_count(1));

    let started = tokio::time::Instant::now();
    let exit = f.writer.with_start_delay(Duration::from_millis(300)).run().await;

    assert!(matches!(exit, WriterExit::Stopped));
    assert_eq!(connector.attempts(), 1);
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_disconnected_requests_are_dead_lettered() {
    let f = fixture(Arc::new(FailingConnector::new()), test_config().with_max_retry_count(1));
    let mut events = f.system.event_stream().subscribe();

    f.handle.try_deliver(message("a").with_sender(client("c1"))).unwrap();
    f.handle.try_deliver(message("b")).unwrap();
    f.handle.try_deliver(message("c").with_sender(client("c2"))).unwrap();

    assert!(matches!(f.writer.run().await, WriterExit::Stopped));

    let responses = f.dispatcher.take();
    assert_eq!(responses.len(), 2);
    let recipients: Vec<_> = responses.iter().map(|e| e.target.id.clone()).collect();
    assert_eq!(recipients, vec!["c1", "c2"]);
    for response in &responses {
        assert_eq!(
            response.message.downcast_ref::<DeadLetterResponse>(),
            Some(&DeadLetterResponse {
                target: Pid::new(REMOTE, "echo")
            })
        );
    }

    let events = drain_events(&mut events);
    assert_eq!(count(&events, |e| matches!(e, RemoteEvent::DeadLetter { .. })), 1);
    assert_eq!(count(&events, |e| e.is_terminated()), 1);
}

#[tokio::test]
async fn test_connect_sends_handshake_and_interned_batch() {
    let (connector, mut peers) = DuplexConnector::new();
    let f = fixture(connector, test_config());
    let mut events = f.system.event_stream().subscribe();

    f.handle.try_deliver(message("one").with_sender(client("c1").with_request_id(4))).unwrap();
    f.handle.try_deliver(message("two")).unwrap();
    let join = f.writer.spawn();

    let mut conn = accept_handshake(&mut peers).await;
    let batch = next_batch(&mut conn).await;

    assert_eq!(batch.type_names, vec!["test.TestMessage"]);
    assert_eq!(batch.targets, vec![Pid::new(REMOTE, "echo")]);
    assert_eq!(batch.senders, vec![client("c1")]);
    assert_eq!(batch.envelopes.len(), 2);
    assert_eq!(batch.envelopes[0].sender, 1);
    assert_eq!(batch.envelopes[0].sender_request_id, 4);
    assert_eq!(batch.envelopes[1].sender, 0);
    assert_eq!(text_of(&batch.envelopes[1].message_data), "two");

    assert!(f.handle.stop());
    assert!(matches!(join.await.unwrap(), WriterExit::Stopped));
    assert_eq!(conn.source.recv().await.unwrap(), None);

    // Self-initiated close does not report the endpoint as terminated
    let events = drain_events(&mut events);
    assert_eq!(count(&events, |e| matches!(e, RemoteEvent::EndpointConnected { .. })), 1);
    assert_eq!(count(&events, |e| e.is_terminated()), 0);
}

#[tokio::test]
async fn test_blocked_response_counts_as_failed_attempt() {
    let (connector, mut peers) = DuplexConnector::new();
    let f = fixture(connector.clone(), test_config().with_max_retry_count(2));
    let mut events = f.system.event_stream().subscribe();

    let peer = tokio::spawn(async move {
        for _ in 0..2 {
            let mut conn = peers.recv().await.unwrap();
            let _ = conn.source.recv().await;
            conn.sink
                .send(&RemoteMessage::ConnectResponse(ConnectResponse {
                    member_id: "sys-b".to_string(),
                    blocked: true,
                }))
                .await
                .unwrap();
        }
    });

    assert!(matches!(f.writer.run().await, WriterExit::Stopped));
    peer.await.unwrap();

    assert_eq!(connector.attempts(), 2);
    let events = drain_events(&mut events);
    assert_eq!(count(&events, |e| e.is_terminated()), 1);
    assert_eq!(count(&events, |e| matches!(e, RemoteEvent::EndpointConnected { .. })), 0);
}

#[tokio::test]
async fn test_unexpected_first_frame_is_failed_attempt() {
    let (connector, mut peers) = DuplexConnector::new();
    let f = fixture(connector.clone(), test_config().with_max_retry_count(1));

    let peer = tokio::spawn(async move {
        let mut conn = peers.recv().await.unwrap();
        let _ = conn.source.recv().await;
        conn.sink
            .send(&RemoteMessage::MessageBatch(MessageBatch::default()))
            .await
            .unwrap();
    });

    assert!(matches!(f.writer.run().await, WriterExit::Stopped));
    peer.await.unwrap();
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn test_send_failure_requeues_batch() {
    let (connector, mut peers) = DuplexConnector::new();
    let f = fixture(connector, test_config());

    let join = f.writer.spawn();
    let conn = accept_handshake(&mut peers).await;
    drop(conn);

    f.handle.try_deliver(message("lost")).unwrap();

    match timeout(WAIT, join).await.unwrap().unwrap() {
        WriterExit::SendFailed { requeued, sent } => {
            assert_eq!(sent, 0);
            assert_eq!(requeued.len(), 1);
            assert_eq!(
                requeued[0].message.downcast_ref::<TestMessage>(),
                Some(&TestMessage::new("lost"))
            );
        }
        other => panic!("Expected SendFailed, got {:?}", other),
    }
    assert!(f.handle.is_closed());
}

#[tokio::test]
async fn test_terminate_in_batch_stops_without_sending() {
    let (connector, mut peers) = DuplexConnector::new();
    let f = fixture(connector, test_config());
    let mut events = f.system.event_stream().subscribe();

    f.handle.try_deliver(message("x")).unwrap();
    assert!(f.handle.terminate());
    let join = f.writer.spawn();

    let mut conn = accept_handshake(&mut peers).await;
    assert!(matches!(timeout(WAIT, join).await.unwrap().unwrap(), WriterExit::Stopped));
    assert_eq!(conn.source.recv().await.unwrap(), None);

    let events = drain_events(&mut events);
    assert_eq!(count(&events, |e| matches!(e, RemoteEvent::DeadLetter { .. })), 1);
    assert!(f.dispatcher.is_empty());
}

#[tokio::test]
async fn test_restart_signal_fails_instance_with_pending() {
    let (connector, mut peers) = DuplexConnector::new();
    let f = fixture(connector, test_config());

    assert!(f.handle.restart_after_connect_failure("boom"));
    f.handle.try_deliver(message("pending")).unwrap();
    let join = f.writer.spawn();
    let _conn = accept_handshake(&mut peers).await;

    match timeout(WAIT, join).await.unwrap().unwrap() {
        WriterExit::Failed { error, pending } => {
            assert!(matches!(error, RemoteError::RestartAfterConnectFailure { ref reason } if reason == "boom"));
            assert_eq!(pending.len(), 1);
        }
        other => panic!("Expected Failed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_seed_is_sent_before_mailbox() {
    let (connector, mut peers) = DuplexConnector::new();
    let f = fixture(connector, test_config());

    f.handle.try_deliver(message("later")).unwrap();
    let join = f.writer.with_seed(vec![message("seed")]).spawn();
    let mut conn = accept_handshake(&mut peers).await;

    let first = next_batch(&mut conn).await;
    let second = next_batch(&mut conn).await;
    assert_eq!(text_of(&first.envelopes[0].message_data), "seed");
    assert_eq!(text_of(&second.envelopes[0].message_data), "later");

    f.handle.stop();
    assert!(matches!(timeout(WAIT, join).await.unwrap().unwrap(), WriterExit::Stopped));
}

#[tokio::test]
async fn test_seed_is_split_by_batch_size() {
    let (connector, mut peers) = DuplexConnector::new();
    let f = fixture(connector, test_config().with_endpoint_writer_batch_size(2));

    let seed = ["s1", "s2", "s3", "s4", "s5"].into_iter().map(message).collect();
    let join = f.writer.with_seed(seed).spawn();
    let mut conn = accept_handshake(&mut peers).await;

    let mut texts = Vec::new();
    for expected in [2, 2, 1] {
        let batch = next_batch(&mut conn).await;
        assert_eq!(batch.envelopes.len(), expected);
        texts.extend(batch.envelopes.iter().map(|e| text_of(&e.message_data)));
    }
    assert_eq!(texts, vec!["s1", "s2", "s3", "s4", "s5"]);

    f.handle.stop();
    assert!(matches!(timeout(WAIT, join).await.unwrap().unwrap(), WriterExit::Stopped));
}

#[tokio::test]
async fn test_oversized_message_is_dead_lettered_without_stalling() {
    let (connector, mut peers) = DuplexConnector::with_max_frame_size(512);
    let f = fixture(connector.clone(), test_config());

    let huge = DeliverRequest::new(
        Pid::new(REMOTE, "echo"),
        Arc::new(TestMessage::new("x".repeat(4096))),
        BINCODE_SERIALIZER_ID,
    )
    .with_sender(client("c1"));
    f.handle.try_deliver(message("before")).unwrap();
    f.handle.try_deliver(huge).unwrap();
    f.handle.try_deliver(message("after")).unwrap();
    let join = f.writer.spawn();
    let mut conn = accept_handshake(&mut peers).await;

    // The oversized run is halved until the small messages fit on their own
    let mut texts = Vec::new();
    while texts.len() < 2 {
        let batch = next_batch(&mut conn).await;
        texts.extend(batch.envelopes.iter().map(|e| text_of(&e.message_data)));
    }
    assert_eq!(texts, vec!["before", "after"]);

    let responses = f.dispatcher.wait_for(1, WAIT).await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].target, client("c1"));
    assert!(responses[0].message.downcast_ref::<DeadLetterResponse>().is_some());

    // Same stream, still writable
    f.handle.try_deliver(message("later")).unwrap();
    let batch = next_batch(&mut conn).await;
    assert_eq!(text_of(&batch.envelopes[0].message_data), "later");
    assert_eq!(connector.attempts(), 1);

    f.handle.stop();
    assert!(matches!(timeout(WAIT, join).await.unwrap().unwrap(), WriterExit::Stopped));
}

#[tokio::test]
async fn test_batches_respect_batch_size() {
    let (connector, mut peers) = DuplexConnector::new();
    let f = fixture(connector, test_config().with_endpoint_writer_batch_size(2));

    for text in ["1", "2", "3"] {
        f.handle.try_deliver(message(text)).unwrap();
    }
    let join = f.writer.spawn();
    let mut conn = accept_handshake(&mut peers).await;

    assert_eq!(next_batch(&mut conn).await.envelopes.len(), 2);
    let tail = next_batch(&mut conn).await;
    assert_eq!(tail.envelopes.len(), 1);
    assert_eq!(text_of(&tail.envelopes[0].message_data), "3");

    f.handle.stop();
    assert!(matches!(timeout(WAIT, join).await.unwrap().unwrap(), WriterExit::Stopped));
}

#[tokio::test]
async fn test_peer_disconnect_publishes_one_terminated() {
    let (connector, mut peers) = DuplexConnector::new();
    let f = fixture(connector, test_config());
    let mut events = f.system.event_stream().subscribe();

    let join = f.writer.with_generation(7).spawn();
    let mut conn = accept_handshake(&mut peers).await;
    conn.sink.send(&RemoteMessage::DisconnectRequest).await.unwrap();

    loop {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let RemoteEvent::EndpointTerminated { address, generation } = event {
            assert_eq!(address, REMOTE);
            assert_eq!(generation, Some(7));
            break;
        }
    }

    f.handle.stop();
    assert!(matches!(timeout(WAIT, join).await.unwrap().unwrap(), WriterExit::Stopped));
    assert_eq!(count(&drain_events(&mut events), |e| e.is_terminated()), 0);
}

#[test]
fn test_writer_future_is_send() {
    fn assert_send<T: Send>(_: &T) {}
    let f = fixture(Arc::new(FailingConnector::new()), test_config());
    let run = f.writer.run();
    assert_send(&run);
}

#[tokio::test]
async fn test_mailbox_bounds() {
    let f = fixture(
        Arc::new(FailingConnector::new()),
        test_config().with_endpoint_writer_queue_size(1),
    );

    f.handle.try_deliver(message("first")).unwrap();
    assert!(matches!(f.handle.try_deliver(message("second")), Err(DeliverError::Full(_))));

    drop(f.writer);
    assert!(matches!(f.handle.try_deliver(message("third")), Err(DeliverError::Closed(_))));
    assert!(!f.handle.stop());
}
