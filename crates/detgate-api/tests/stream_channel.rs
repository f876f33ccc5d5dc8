//! Streaming detection channel tests against a live listener.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::WebSocketUpgrade;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use common::{eventually, fake_jpeg, file_count, Behavior, FakeBackend, TestGateway};
use detgate_api::ws::{run_session, StreamSettings};
use detgate_api::GatewayConfig;
use detgate_inference::InferenceError;
use detgate_models::{ConnectionState, StreamSession};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{}/ws/detect", addr)).await.unwrap();
    client
}

/// Next text message, skipping control frames. `None` on close or timeout.
async fn next_text(client: &mut Client, within: Duration) -> Option<Value> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let next = tokio::time::timeout_at(deadline, client.next()).await.ok()??;
        match next.ok()? {
            Message::Text(text) => return serde_json::from_str(&text).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

/// Serve bare streaming sessions for `gateway`, reporting each finished
/// session on the returned channel.
async fn serve_sessions(gateway: &TestGateway) -> (SocketAddr, mpsc::UnboundedReceiver<StreamSession>) {
    let (finished_tx, finished_rx) = mpsc::unbounded_channel();
    let detector = gateway.state.detector.clone();
    let settings = StreamSettings::from(&gateway.state.config);

    let app = Router::new().route(
        "/ws/detect",
        get(move |ws: WebSocketUpgrade| {
            let detector = detector.clone();
            let finished_tx = finished_tx.clone();
            async move {
                ws.on_upgrade(move |socket| async move {
                    let session = run_session(socket, detector, settings).await;
                    let _ = finished_tx.send(session);
                })
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, finished_rx)
}

/// Wait for the server's close frame.
async fn expect_closed(client: &mut Client, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        match tokio::time::timeout_at(deadline, client.next()).await {
            Err(_) => return false,
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

#[tokio::test]
async fn test_burst_of_frames_yields_one_invocation() {
    let backend = FakeBackend::new(Behavior::Slow(Duration::from_millis(600), "real"));
    let gateway = TestGateway::new(backend.clone()).await;
    let addr = gateway.spawn().await;
    let mut client = connect(addr).await;

    for _ in 0..5 {
        client.send(Message::Binary(fake_jpeg(2048))).await.unwrap();
    }

    let first = next_text(&mut client, Duration::from_secs(5)).await.expect("one result");
    assert_eq!(first, serde_json::json!({ "result": "real", "seq": 1 }));

    // Dropped frames produce no message.
    assert!(next_text(&mut client, Duration::from_millis(800)).await.is_none());

    assert_eq!(backend.calls(), 1);
    assert_eq!(backend.max_in_flight(), 1);
    assert_eq!(gateway.store().staged_count(), 1);

    client.close(None).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || gateway.store().release_count() == 1).await);
    assert_eq!(file_count(gateway.scratch.path()), 0);
}

#[tokio::test]
async fn test_burst_drops_frames_while_busy() {
    let backend = FakeBackend::new(Behavior::Slow(Duration::from_millis(600), "real"));
    let gateway = TestGateway::new(backend.clone()).await;
    let (addr, mut finished) = serve_sessions(&gateway).await;
    let mut client = connect(addr).await;

    for _ in 0..5 {
        client.send(Message::Binary(fake_jpeg(2048))).await.unwrap();
    }
    let first = next_text(&mut client, Duration::from_secs(5)).await.expect("one result");
    assert_eq!(first["seq"], 1);
    client.close(None).await.unwrap();

    let session = tokio::time::timeout(Duration::from_secs(5), finished.recv())
        .await
        .unwrap()
        .expect("finished session");
    assert_eq!(session.state(), ConnectionState::Closed);
    assert_eq!(session.last_frame_seq, 5);
    assert_eq!(session.frames_accepted, 1);
    assert_eq!(session.frames_dropped, 4);
    assert_eq!(session.results_sent, 1);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_frames_after_completion_are_accepted() {
    let backend = FakeBackend::new(Behavior::Label("AI generated"));
    let gateway = TestGateway::new(backend.clone()).await;
    let addr = gateway.spawn().await;
    let mut client = connect(addr).await;

    for expected_seq in 1..=3 {
        client.send(Message::Binary(fake_jpeg(512))).await.unwrap();
        let result = next_text(&mut client, Duration::from_secs(5)).await.expect("result");
        assert_eq!(result["result"], "AI generated");
        assert_eq!(result["seq"], expected_seq);
    }

    assert_eq!(backend.calls(), 3);
    assert_eq!(backend.max_in_flight(), 1);
}

#[tokio::test]
async fn test_min_interval_drops_fast_frames() {
    let backend = FakeBackend::new(Behavior::Label("real"));
    let config = GatewayConfig {
        frame_interval: Duration::from_secs(5),
        ..common::test_config()
    };
    let gateway = TestGateway::with_config(backend.clone(), config).await;
    let addr = gateway.spawn().await;
    let mut client = connect(addr).await;

    client.send(Message::Binary(fake_jpeg(512))).await.unwrap();
    assert!(next_text(&mut client, Duration::from_secs(5)).await.is_some());

    for _ in 0..3 {
        client.send(Message::Binary(fake_jpeg(512))).await.unwrap();
    }
    assert!(next_text(&mut client, Duration::from_millis(500)).await.is_none());
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_client_close_cancels_in_flight_detection() {
    let backend = FakeBackend::new(Behavior::WaitForCancel);
    let gateway = TestGateway::new(backend.clone()).await;
    let addr = gateway.spawn().await;
    let mut client = connect(addr).await;

    client.send(Message::Binary(fake_jpeg(1024))).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || backend.calls() == 1).await);
    assert_eq!(file_count(gateway.scratch.path()), 1);

    client.close(None).await.unwrap();

    assert!(eventually(Duration::from_secs(3), || backend.cancellations() == 1).await);
    assert!(eventually(Duration::from_secs(3), || gateway.store().release_count() == 1).await);
    assert_eq!(file_count(gateway.scratch.path()), 0);
}

#[tokio::test]
async fn test_abrupt_disconnect_cancels_in_flight_detection() {
    let backend = FakeBackend::new(Behavior::WaitForCancel);
    let gateway = TestGateway::new(backend.clone()).await;
    let addr = gateway.spawn().await;
    let mut client = connect(addr).await;

    client.send(Message::Binary(fake_jpeg(1024))).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || backend.calls() == 1).await);

    // No close handshake
    drop(client);

    assert!(eventually(Duration::from_secs(3), || backend.cancellations() == 1).await);
    assert!(eventually(Duration::from_secs(3), || file_count(gateway.scratch.path()) == 0).await);
}

#[tokio::test]
async fn test_close_control_message() {
    let gateway = TestGateway::new(FakeBackend::new(Behavior::Label("real"))).await;
    let addr = gateway.spawn().await;
    let mut client = connect(addr).await;

    client.send(Message::Text("hello".to_string())).await.unwrap();
    client.send(Message::Text(r#"{"type":"close"}"#.to_string())).await.unwrap();

    assert!(expect_closed(&mut client, Duration::from_secs(3)).await);
}

#[tokio::test]
async fn test_per_frame_failure_keeps_session_open() {
    let backend = FakeBackend::new(Behavior::FailFirst(
        || InferenceError::Timeout(Duration::from_secs(30)),
        "real",
    ));
    let gateway = TestGateway::new(backend.clone()).await;
    let addr = gateway.spawn().await;
    let mut client = connect(addr).await;

    client.send(Message::Binary(fake_jpeg(512))).await.unwrap();
    assert!(next_text(&mut client, Duration::from_millis(500)).await.is_none());

    client.send(Message::Binary(fake_jpeg(512))).await.unwrap();
    let result = next_text(&mut client, Duration::from_secs(5)).await.expect("result");
    assert_eq!(result, serde_json::json!({ "result": "real", "seq": 2 }));
    assert_eq!(gateway.store().release_count(), 2);
}

#[tokio::test]
async fn test_launch_failure_closes_session() {
    let backend = FakeBackend::new(Behavior::Fail(|| InferenceError::launch_failed("python3: not found")));
    let gateway = TestGateway::new(backend).await;
    let addr = gateway.spawn().await;
    let mut client = connect(addr).await;

    client.send(Message::Binary(fake_jpeg(512))).await.unwrap();

    let error = next_text(&mut client, Duration::from_secs(5)).await.expect("error message");
    assert_eq!(error, serde_json::json!({ "error": "Failed to process file", "kind": "launch_failed" }));
    assert!(!error.to_string().contains("python3"));
    assert!(expect_closed(&mut client, Duration::from_secs(3)).await);
    assert_eq!(file_count(gateway.scratch.path()), 0);
}

#[tokio::test]
async fn test_idle_session_is_closed() {
    let config = GatewayConfig {
        idle_timeout: Duration::from_millis(300),
        ..common::test_config()
    };
    let gateway = TestGateway::with_config(FakeBackend::new(Behavior::Label("real")), config).await;
    let addr = gateway.spawn().await;
    let mut client = connect(addr).await;

    assert!(expect_closed(&mut client, Duration::from_secs(3)).await);
}

#[tokio::test]
async fn test_stream_requires_api_key_when_configured() {
    let config = GatewayConfig {
        api_keys: vec!["letmein".to_string()],
        ..common::test_config()
    };
    let gateway = TestGateway::with_config(FakeBackend::new(Behavior::Label("real")), config).await;
    let addr = gateway.spawn().await;

    assert!(connect_async(format!("ws://{}/ws/detect", addr)).await.is_err());

    let (mut client, _) = connect_async(format!("ws://{}/ws/detect?api_key=letmein", addr))
        .await
        .unwrap();
    client.send(Message::Binary(fake_jpeg(512))).await.unwrap();
    assert!(next_text(&mut client, Duration::from_secs(5)).await.is_some());
}

#[cfg(unix)]
mod process_worker {
    use std::sync::Arc;

    use detgate_inference::{ProcessBackend, ProcessBackendConfig};

    use super::*;

    fn pid_alive(pid: &str) -> bool {
        std::process::Command::new("kill")
            .args(["-0", pid])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_disconnect_kills_running_worker() {
        let marker = tempfile::TempDir::new().unwrap();
        let pid_file = marker.path().join("worker.pid");
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());
        let backend = Arc::new(ProcessBackend::new(ProcessBackendConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script, "worker".to_string()],
            timeout: Duration::from_secs(60),
            kill_grace: Duration::from_secs(2),
        }));
        let gateway = TestGateway::new(backend).await;
        let addr = gateway.spawn().await;
        let mut client = connect(addr).await;

        client.send(Message::Binary(fake_jpeg(1024))).await.unwrap();
        assert!(eventually(Duration::from_secs(5), || {
            std::fs::read_to_string(&pid_file).map(|s| !s.trim().is_empty()).unwrap_or(false)
        })
        .await);
        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        assert!(pid_alive(&pid));

        client.close(None).await.unwrap();

        assert!(eventually(Duration::from_secs(5), || !pid_alive(&pid)).await);
        assert!(eventually(Duration::from_secs(3), || file_count(gateway.scratch.path()) == 0).await);
    }
}
