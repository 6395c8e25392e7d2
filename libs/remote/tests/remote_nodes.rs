//! # Two-Node Remoting Tests
//!
//! ```text
//! node-a (Remote) ── TCP ──► node-b (Remote)
//!      ▲                          │
//!      └──────── TCP ◄────────────┘  replies to the sender PID
//! ```
//!
//! Each node binds an ephemeral loopback port, so the tests can run in
//! parallel.

use actor_remote::test_utils::{drain_events, test_config, test_system, RecordingDispatcher, TestMessage};
use actor_remote::{
    Pid, Remote, RemoteError, RemoteEvent, ShutdownOutcome, BINCODE_SERIALIZER_ID,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

async fn start_node(id: &str) -> (Remote, Arc<RecordingDispatcher>, SocketAddr) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (system, dispatcher) = test_system(id);
    let remote = Remote::new(system, test_config());
    let addr = remote.start().await.expect("node should start");
    (remote, dispatcher, addr)
}

async fn wait_for_event<F>(rx: &mut broadcast::Receiver<RemoteEvent>, mut matches: F) -> Option<RemoteEvent>
where
    F: FnMut(&RemoteEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) if matches(&event) => return Some(event),
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            _ => return None,
        }
    }
}

#[tokio::test]
async fn test_message_round_trip_between_nodes() {
    let (node_a, received_a, addr_a) = start_node("node-a").await;
    let (node_b, received_b, addr_b) = start_node("node-b").await;

    let client = Pid::new(addr_a.to_string(), "client");
    let echo = Pid::new(addr_b.to_string(), "echo");
    node_a.send_message(
        echo.clone(),
        None,
        Arc::new(TestMessage::new("ping")),
        Some(client.clone()),
        BINCODE_SERIALIZER_ID,
    );

    let delivered = received_b.wait_for(1, WAIT).await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].target, echo);
    assert_eq!(delivered[0].sender.as_ref(), Some(&client));
    assert_eq!(delivered[0].message.downcast_ref::<TestMessage>(), Some(&TestMessage::new("ping")));

    // Reply through the sender carried on the wire
    let reply_to = delivered[0].sender.clone().expect("sender travels with the message");
    node_b.send_message(reply_to, None, Arc::new(TestMessage::new("pong")), None, BINCODE_SERIALIZER_ID);

    let replies = received_a.wait_for(1, WAIT).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].target, client);
    assert_eq!(replies[0].message.downcast_ref::<TestMessage>(), Some(&TestMessage::new("pong")));

    assert_eq!(node_a.shutdown(true).await.unwrap(), ShutdownOutcome::Graceful);
    assert_eq!(node_b.shutdown(true).await.unwrap(), ShutdownOutcome::Graceful);
}

#[tokio::test]
async fn test_messages_keep_order_per_destination() {
    let (node_a, _received_a, _) = start_node("node-a").await;
    let (node_b, received_b, addr_b) = start_node("node-b").await;

    let target = Pid::new(addr_b.to_string(), "sink");
    for i in 0..50 {
        node_a.send_message(
            target.clone(),
            None,
            Arc::new(TestMessage::new(format!("m{}", i))),
            None,
            BINCODE_SERIALIZER_ID,
        );
    }

    let delivered = received_b.wait_for(50, WAIT).await;
    let texts: Vec<String> = delivered
        .iter()
        .filter_map(|e| e.message.downcast_ref::<TestMessage>())
        .map(|m| m.text.clone())
        .collect();
    let expected: Vec<String> = (0..50).map(|i| format!("m{}", i)).collect();
    assert_eq!(texts, expected);

    node_a.shutdown(true).await.unwrap();
    node_b.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_blocked_system_is_refused() {
    let (node_a, _received_a, _) = start_node("node-a").await;
    let (node_b, received_b, addr_b) = start_node("node-b").await;
    node_b.block_list().block(["node-a"]);

    let mut events = node_a.system().event_stream().subscribe();
    let target = Pid::new(addr_b.to_string(), "echo");
    node_a.send_message(target.clone(), None, Arc::new(TestMessage::new("x")), None, BINCODE_SERIALIZER_ID);

    let terminated = wait_for_event(&mut events, |e| e.is_terminated()).await;
    assert_eq!(
        terminated.as_ref().and_then(|e| e.address()),
        Some(addr_b.to_string().as_str())
    );

    let dead = wait_for_event(&mut events, |e| matches!(e, RemoteEvent::DeadLetter { .. })).await;
    match dead {
        Some(RemoteEvent::DeadLetter { target: dead_target, .. }) => assert_eq!(dead_target, target),
        other => panic!("expected dead letter, got {:?}", other),
    }
    assert!(received_b.is_empty());

    node_a.shutdown(true).await.unwrap();
    node_b.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown_disconnects_peers() {
    let (node_a, _received_a, _) = start_node("node-a").await;
    let (node_b, received_b, addr_b) = start_node("node-b").await;

    let mut events = node_a.system().event_stream().subscribe();
    node_a.send_message(
        Pid::new(addr_b.to_string(), "echo"),
        None,
        Arc::new(TestMessage::new("hello")),
        None,
        BINCODE_SERIALIZER_ID,
    );
    assert_eq!(received_b.wait_for(1, WAIT).await.len(), 1);

    assert_eq!(node_b.shutdown(true).await.unwrap(), ShutdownOutcome::Graceful);

    let terminated = wait_for_event(&mut events, |e| e.is_terminated()).await;
    assert_eq!(
        terminated.as_ref().and_then(|e| e.address()),
        Some(addr_b.to_string().as_str())
    );

    node_a.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_repeated_shutdown_publishes_events_once() {
    let (node_a, _received_a, _) = start_node("node-a").await;
    let (node_b, received_b, addr_b) = start_node("node-b").await;

    node_a.send_message(
        Pid::new(addr_b.to_string(), "echo"),
        None,
        Arc::new(TestMessage::new("hello")),
        None,
        BINCODE_SERIALIZER_ID,
    );
    assert_eq!(received_b.wait_for(1, WAIT).await.len(), 1);

    let mut peer_events = node_a.system().event_stream().subscribe();
    let mut own_events = node_b.system().event_stream().subscribe();

    assert_eq!(node_b.shutdown(true).await.unwrap(), ShutdownOutcome::Graceful);
    assert!(wait_for_event(&mut peer_events, |e| e.is_terminated()).await.is_some());

    assert_eq!(node_b.shutdown(true).await.unwrap(), ShutdownOutcome::AlreadyStopped);
    assert_eq!(node_b.shutdown(false).await.unwrap(), ShutdownOutcome::AlreadyStopped);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(drain_events(&mut peer_events).iter().filter(|e| e.is_terminated()).count(), 0);
    assert!(drain_events(&mut own_events)
        .iter()
        .all(|e| !e.is_terminated() && !matches!(e, RemoteEvent::EndpointConnected { .. })));

    node_a.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_lifecycle() {
    let (system, _dispatcher) = test_system("node-a");
    let remote = Remote::new(system, test_config());

    assert!(matches!(remote.shutdown(true).await, Err(RemoteError::NotStarted)));
    assert!(remote.address().await.is_none());

    let first = remote.start().await.unwrap();
    let second = remote.start().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(remote.address().await, Some(first.to_string()));

    assert_eq!(remote.shutdown(true).await.unwrap(), ShutdownOutcome::Graceful);
    assert_eq!(remote.shutdown(true).await.unwrap(), ShutdownOutcome::AlreadyStopped);
    assert_eq!(remote.shutdown(false).await.unwrap(), ShutdownOutcome::AlreadyStopped);
    assert!(matches!(remote.start().await, Err(RemoteError::Stopped)));
}

#[tokio::test]
async fn test_send_after_shutdown_dead_letters() {
    let (node_a, _received_a, _) = start_node("node-a").await;
    node_a.shutdown(true).await.unwrap();

    let mut events = node_a.system().event_stream().subscribe();
    node_a.send_message(
        Pid::new("127.0.0.1:9", "gone"),
        None,
        Arc::new(TestMessage::new("late")),
        None,
        BINCODE_SERIALIZER_ID,
    );

    let dead = wait_for_event(&mut events, |e| matches!(e, RemoteEvent::DeadLetter { .. })).await;
    assert!(dead.is_some());
}

#[tokio::test]
async fn test_shutdown_timeout_forces_close() {
    let (system, _dispatcher) = test_system("node-b");
    let remote = Remote::new(system, test_config().with_shutdown_timeout(Duration::ZERO));
    let addr = remote.start().await.unwrap();

    // Connected but silent: the stream is still waiting for its handshake
    let _idle = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(remote.shutdown(true).await.unwrap(), ShutdownOutcome::Forced);
}

#[tokio::test]
async fn test_non_graceful_shutdown_kills() {
    let (node_b, _received_b, addr_b) = start_node("node-b").await;
    let _idle = TcpStream::connect(addr_b).await.unwrap();

    assert_eq!(node_b.shutdown(false).await.unwrap(), ShutdownOutcome::Killed);
    assert_eq!(node_b.shutdown(true).await.unwrap(), ShutdownOutcome::AlreadyStopped);
}

#[tokio::test]
async fn test_https_without_tls_connector_is_rejected() {
    let (system, _dispatcher) = test_system("node-a");
    let config = test_config()
        .with_scheme(actor_remote::Scheme::Https)
        .with_client_tls(actor_remote::config::TlsConfig {
            cert_path: "client.pem".into(),
            key_path: "client.key".into(),
            ca_path: None,
        });
    let remote = Remote::new(system, config);

    assert!(matches!(remote.start().await, Err(RemoteError::Configuration { .. })));
}
