use std::sync::Arc;
use std::time::Duration;

use rtdialog_frame::{event, Frame, FrameError, MessageType};
use rtdialog_transport::{
    CloseReason, ConnectMode, ConnectTarget, ConnectionState, MemoryConnector, MemoryServer,
    ServerConnection, TransportClient, TransportConfig, TransportError, TransportEvent,
};
use tokio::sync::mpsc::UnboundedReceiver;

fn target() -> ConnectTarget {
    ConnectTarget::new("wss://dialog.test/api", "conn-1")
        .with_header("X-Api-App-ID", "app")
        .with_header("X-Api-Connect-Id", "conn-1")
}

async fn open(
    connector: MemoryConnector,
    mut server: MemoryServer,
    config: TransportConfig,
) -> (
    Arc<TransportClient>,
    UnboundedReceiver<TransportEvent>,
    ServerConnection,
) {
    let (client, events) = TransportClient::new(Arc::new(connector), target(), config);
    client.connect().expect("connect should start");
    let conn = server.accept().await.expect("server should accept");
    client
        .wait_for_connection(Duration::from_secs(1))
        .await
        .expect("connection should open");
    (Arc::new(client), events, conn)
}

async fn next_event(events: &mut UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("event should arrive")
        .expect("event channel open")
}

#[tokio::test]
async fn connect_and_exchange_frames() {
    let (connector, server) = MemoryConnector::new();
    let (client, mut events, mut conn) = open(connector, server, TransportConfig::default()).await;

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(conn.target().header("x-api-app-id"), Some("app"));

    let hello = Frame::client_event(event::START_CONNECTION, None, &b"{}"[..]);
    client.send(&hello).await.unwrap();
    let received = conn.recv_frame().await.unwrap().unwrap();
    assert_eq!(received, hello);

    let ack = Frame::new(MessageType::FullServerResponse)
        .with_event(event::CONNECTION_STARTED)
        .with_connect_id("conn-1")
        .with_payload(&b"{}"[..]);
    conn.send_frame(&ack).unwrap();

    match next_event(&mut events).await {
        TransportEvent::Frame(frame) => assert_eq!(frame, ack),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(client.frames_received(), 1);
}

#[tokio::test(start_paused = true)]
async fn wait_for_connection_times_out() {
    let (connector, server) = MemoryConnector::new();
    let connector = connector.with_mode(ConnectMode::Pending);
    let (client, _events) =
        TransportClient::new(Arc::new(connector), target(), TransportConfig::default());
    client.connect().unwrap();

    let started = tokio::time::Instant::now();
    let err = client
        .wait_for_connection(Duration::from_secs(10))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, TransportError::ConnectTimeout(_)));
    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed < Duration::from_millis(10_050));
    assert_eq!(client.state(), ConnectionState::Connecting);
    assert_eq!(server.connect_attempts(), 1);

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn refused_connection_reports_dial_error() {
    let (connector, _server) = MemoryConnector::new();
    let connector = connector.with_mode(ConnectMode::Refuse("403 forbidden".to_string()));
    let (client, mut events) =
        TransportClient::new(Arc::new(connector), target(), TransportConfig::default());
    client.connect().unwrap();

    let err = client
        .wait_for_connection(Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Connect { ref reason, .. } if reason == "403 forbidden"));

    match next_event(&mut events).await {
        TransportEvent::Closed(CloseReason::ConnectFailed(reason)) => {
            assert!(reason.contains("403"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn connect_twice_is_rejected() {
    let (connector, _server) = MemoryConnector::new();
    let (client, _events) =
        TransportClient::new(Arc::new(connector), target(), TransportConfig::default());
    client.connect().unwrap();
    assert!(matches!(
        client.connect(),
        Err(TransportError::AlreadyStarted)
    ));
}

#[tokio::test]
async fn send_requires_open_connection_and_close_is_idempotent() {
    let (connector, server) = MemoryConnector::new();
    let frame = Frame::client_event(event::START_CONNECTION, None, &b"{}"[..]);

    let (idle, _idle_events) = TransportClient::new(
        Arc::new(MemoryConnector::new().0),
        target(),
        TransportConfig::default(),
    );
    assert!(matches!(
        idle.send(&frame).await,
        Err(TransportError::NotConnected)
    ));

    let (client, mut events, mut conn) = open(connector, server, TransportConfig::default()).await;
    client.close().await;
    client.close().await;

    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(
        client.send(&frame).await,
        Err(TransportError::NotConnected)
    ));
    assert!(matches!(
        client.try_send(&frame),
        Err(TransportError::NotConnected)
    ));

    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Closed(CloseReason::Local)
    ));
    assert!(events.try_recv().is_err());
    assert!(conn.recv_raw().await.is_none());
}

#[tokio::test]
async fn undecodable_frame_is_fatal() {
    let (connector, server) = MemoryConnector::new();
    let (client, mut events, conn) = open(connector, server, TransportConfig::default()).await;

    conn.send_raw(vec![0x11, 0x90]).unwrap();

    match next_event(&mut events).await {
        TransportEvent::Closed(CloseReason::Decode(err)) => {
            assert!(matches!(err, FrameError::TruncatedHeader { .. }));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(client.state(), ConnectionState::Closed);

    let frame = Frame::client_event(event::FINISH_CONNECTION, None, &b"{}"[..]);
    assert!(matches!(
        client.send(&frame).await,
        Err(TransportError::NotConnected)
    ));
}

#[tokio::test]
async fn remote_close_is_reported_once() {
    let (connector, server) = MemoryConnector::new();
    let (client, mut events, mut conn) = open(connector, server, TransportConfig::default()).await;

    conn.close(1000, "bye");

    match next_event(&mut events).await {
        TransportEvent::Closed(CloseReason::Remote { code, reason }) => {
            assert_eq!(code, Some(1000));
            assert_eq!(reason, "bye");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    client.close().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn concurrent_senders_never_interleave() {
    let (connector, server) = MemoryConnector::new();
    let (client, _events, mut conn) = open(connector, server, TransportConfig::default()).await;

    let audio_client = Arc::clone(&client);
    let audio = tokio::spawn(async move {
        for i in 0..100u32 {
            let pcm = i.to_be_bytes().repeat(80);
            audio_client.send(&Frame::audio("s1", pcm)).await.unwrap();
            if i % 7 == 0 {
                tokio::task::yield_now().await;
            }
        }
    });
    let control_client = Arc::clone(&client);
    let control = tokio::spawn(async move {
        for i in 0..10u32 {
            let payload = format!("{{\"content\":\"{i}\"}}");
            let frame = Frame::client_event(event::CHAT_TTS_TEXT, Some("s1"), payload);
            control_client.send(&frame).await.unwrap();
            tokio::task::yield_now().await;
        }
    });
    audio.await.unwrap();
    control.await.unwrap();

    let mut audio_seen = Vec::new();
    let mut control_seen = Vec::new();
    for _ in 0..110 {
        let frame = conn.recv_frame().await.unwrap().expect("whole frame");
        match frame.message_type {
            MessageType::AudioOnlyClientRequest => {
                assert_eq!(frame.payload.len(), 320);
                let mut tag = [0u8; 4];
                tag.copy_from_slice(&frame.payload[..4]);
                audio_seen.push(u32::from_be_bytes(tag));
            }
            MessageType::FullClientRequest => {
                control_seen.push(String::from_utf8(frame.payload.to_vec()).unwrap());
            }
            other => panic!("unexpected type {other:?}"),
        }
    }

    assert_eq!(audio_seen, (0..100).collect::<Vec<_>>());
    let expected: Vec<String> = (0..10).map(|i| format!("{{\"content\":\"{i}\"}}")).collect();
    assert_eq!(control_seen, expected);
    assert_eq!(client.frames_sent(), 110);
}

#[tokio::test]
async fn try_send_reports_full_queue_when_peer_stalls() {
    let (connector, server) = MemoryConnector::new();
    let connector = connector.with_wire_capacity(1);
    let config = TransportConfig {
        write_queue_depth: 2,
        ..TransportConfig::default()
    };
    let (client, _events, _conn) = open(connector, server, config).await;

    let mut full = 0;
    for i in 0..10u8 {
        match client.try_send(&Frame::audio("s1", vec![i; 32])) {
            Ok(()) => {}
            Err(TransportError::WriteQueueFull) => full += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
        tokio::task::yield_now().await;
    }
    assert!(full > 0, "a stalled peer must surface as a full write queue");
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn frames_queued_before_close_are_flushed() {
    let (connector, server) = MemoryConnector::new();
    let (client, _events, mut conn) = open(connector, server, TransportConfig::default()).await;

    let finish_session = Frame::client_event(event::FINISH_SESSION, Some("s1"), &b"{}"[..]);
    let finish_connection = Frame::client_event(event::FINISH_CONNECTION, None, &b"{}"[..]);
    client.send(&finish_session).await.unwrap();
    client.send(&finish_connection).await.unwrap();
    client.close().await;

    assert_eq!(conn.recv_frame().await.unwrap().unwrap(), finish_session);
    assert_eq!(conn.recv_frame().await.unwrap().unwrap(), finish_connection);
    assert!(conn.recv_raw().await.is_none());
    assert_eq!(client.frames_sent(), 2);
}
