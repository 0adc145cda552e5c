#![allow(clippy::unwrap_used)]
// Integration tests for `Notification2Client` against an in-process
// WebSocket server speaking the line-oriented consumer protocol.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use url::Url;

use c8y_realtime::{ConsumerConfig, Notification2Client, RealtimeAction};

// ── Helpers ─────────────────────────────────────────────────────────

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config_for(addr: SocketAddr) -> ConsumerConfig {
    init_tracing();
    let mut config = ConsumerConfig::new(
        Url::parse(&format!("http://{addr}")).unwrap(),
        SecretString::from("sub-token".to_string()),
    );
    config.reconnect.initial_delay = Duration::from_millis(50);
    config
}

// ── Delivery and acknowledgement ────────────────────────────────────

#[tokio::test]
async fn delivers_notifications_and_echoes_acks() {
    let (uri_tx, uri_rx) = tokio::sync::oneshot::channel::<String>();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| {
                let _ = uri_tx.send(request.uri().to_string());
                Ok(response)
            },
        )
        .await
        .unwrap();

        ws.send(Message::text(
            "CLJuEJgjIAAwAQ==\n/t123456/measurements/12345\nCREATE\n\n{\"id\":\"12345\"}",
        ))
        .await
        .unwrap();

        // The ack must be a text frame with exactly the identifier bytes.
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(ack))) => {
                    assert_eq!(ack.as_str(), "CLJuEJgjIAAwAQ==");
                    break;
                }
                Some(Ok(_)) => {}
                other => panic!("expected ack frame, got {other:?}"),
            }
        }
    });

    let mut config = config_for(addr);
    config.consumer = Some("worker-1".into());

    let client = Notification2Client::new(config);
    let mut notifications = client.notifications().unwrap();
    client.connect().await.unwrap();
    client
        .wait_for_connection(Duration::from_secs(5))
        .await
        .unwrap();

    // The upgrade request carries the auth and session query params.
    let uri = uri_rx.await.unwrap();
    assert!(uri.starts_with("/notification2/consumer/"));
    assert!(uri.contains("token=sub-token"));
    assert!(uri.contains("consumer=worker-1"));

    let notification = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.identifier, "CLJuEJgjIAAwAQ==");
    assert_eq!(notification.description, "/t123456/measurements/12345");
    assert_eq!(notification.action, Some(RealtimeAction::Create));
    assert_eq!(notification.payload, "{\"id\":\"12345\"}");

    client.send_ack(&notification.identifier).await.unwrap();
    server.await.unwrap(); // server-side ack assertion ran

    client.close().await;
}

// ── Keepalive ───────────────────────────────────────────────────────

#[tokio::test]
async fn session_stays_alive_across_ping_intervals() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let _server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        // Keep reading so inbound pings get their automatic pongs.
        while let Some(Ok(_)) = ws.next().await {}
    });

    let mut config = config_for(addr);
    config.ping_interval = Duration::from_millis(50);

    let client = Notification2Client::new(config);
    client.connect().await.unwrap();
    client
        .wait_for_connection(Duration::from_secs(5))
        .await
        .unwrap();

    // Several ping rounds; each pong must clear the deadline.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client.is_connected());

    client.close().await;
}

#[tokio::test]
async fn reconnects_when_pongs_stop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let _server = tokio::spawn(async move {
        // Session 1: upgrade, then go silent. Never reading means the
        // automatic pong replies never flush, so the client's pings go
        // unanswered.
        let (stream, _) = listener.accept().await.unwrap();
        let silent = tokio_tungstenite::accept_async(stream).await.unwrap();

        // Session 2: healthy; deliver a frame and keep reading.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        drop(silent);
        ws.send(Message::text("id-2\n/t1/alarms/7\nUPDATE\n\n{}"))
            .await
            .unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let mut config = config_for(addr);
    config.ping_interval = Duration::from_millis(50);

    let client = Notification2Client::new(config);
    let mut notifications = client.notifications().unwrap();
    client.connect().await.unwrap();

    // The notification arrives on the second session, after the missing
    // pong tore the first one down.
    let notification = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.identifier, "id-2");
    assert_eq!(notification.description, "/t1/alarms/7");
    assert_eq!(notification.action, Some(RealtimeAction::Update));

    client.close().await;
}
