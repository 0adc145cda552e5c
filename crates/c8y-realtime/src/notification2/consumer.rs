// ── Notification2 consumer client ──
//
// Long-lived consumer of the notification2 WebSocket endpoint. Same
// supervisor shape as the Bayeux connection: one task owns dial, read
// loop, ping keepalive, and reconnect with backoff. There is no
// handshake -- auth is the `token` query parameter -- and inbound frames
// are the line-oriented text protocol from `frame.rs`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Bytes, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ConsumerConfig;
use crate::connection::SessionState;
use crate::error::Error;

use super::frame::{self, SharedNotification};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Client for the notification2 consumer endpoint.
///
/// Notifications arrive on a single bounded stream taken once with
/// [`notifications`](Self::notifications); acknowledge delivery with
/// [`send_ack`](Self::send_ack) for at-least-once semantics.
#[derive(Clone)]
pub struct Notification2Client {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    config: ConsumerConfig,
    sink: Mutex<Option<WsSink>>,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    notification_tx: mpsc::Sender<SharedNotification>,
    notification_rx: std::sync::Mutex<Option<mpsc::Receiver<SharedNotification>>>,
    seq: AtomicU64,
    cancel: CancellationToken,
    started: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Notification2Client {
    /// Create a client. Does NOT connect -- call
    /// [`connect()`](Self::connect) to start the stream.
    pub fn new(config: ConsumerConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (notification_tx, notification_rx) = mpsc::channel(config.buffer.max(1));

        Self {
            inner: Arc::new(ConsumerInner {
                config,
                sink: Mutex::new(None),
                state_tx,
                state_rx,
                notification_tx,
                notification_rx: std::sync::Mutex::new(Some(notification_rx)),
                seq: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                supervisor: Mutex::new(None),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start consuming. Idempotent; returns immediately and connects
    /// asynchronously.
    pub async fn connect(&self) -> Result<(), Error> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Closed);
        }
        self.inner.config.websocket_url().map(|_| ())?;

        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("connect() called while already running, ignoring");
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { run(inner).await });
        *self.inner.supervisor.lock().await = Some(handle);
        Ok(())
    }

    /// Block until the stream is up, the client is closed, or `timeout`
    /// elapses.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<(), Error> {
        let mut state_rx = self.inner.state_rx.clone();

        let wait = state_rx.wait_for(|s| s.is_connected() || s.is_closed());
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(state)) if state.is_connected() => Ok(()),
            Ok(_) => Err(Error::Closed),
            Err(_) => Err(Error::Timeout {
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state_rx.borrow().is_connected()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state_rx.borrow().clone()
    }

    /// Subscribe to connection state changes.
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.inner.state_rx.clone()
    }

    /// Take the notification stream. Can be taken exactly once; `None`
    /// on subsequent calls.
    pub fn notifications(&self) -> Option<mpsc::Receiver<SharedNotification>> {
        self.inner
            .notification_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Shut down: best-effort close frame, stop the supervisor, release
    /// the socket. Idempotent.
    pub async fn close(&self) {
        if !self.inner.cancel.is_cancelled() {
            self.inner.cancel.cancel();

            let mut guard = self.inner.sink.lock().await;
            if let Some(sink) = guard.as_mut() {
                let _ = sink.send(WsMessage::Close(None)).await;
            }
            *guard = None;
            drop(guard);

            let _ = self.inner.state_tx.send(SessionState::Closed);
            info!("notification consumer closed");
        }

        if let Some(handle) = self.inner.supervisor.lock().await.take() {
            let _ = handle.await;
        }
    }

    // ── Acknowledgement ──────────────────────────────────────────────

    /// Acknowledge a delivered notification by its identifier. The
    /// server redelivers unacknowledged messages, giving at-least-once
    /// semantics across reconnects.
    pub async fn send_ack(&self, identifier: &str) -> Result<(), Error> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Closed);
        }

        let mut guard = self.inner.sink.lock().await;
        let sink = guard.as_mut().ok_or(Error::NotConnected)?;

        let send = sink.send(WsMessage::text(frame::encode_ack(identifier)));
        match tokio::time::timeout(self.inner.config.write_timeout, send).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Send(e.to_string())),
            Err(_) => Err(Error::Send("ack write deadline exceeded".into())),
        }
    }
}

// ── Supervisor ───────────────────────────────────────────────────────

async fn run(inner: Arc<ConsumerInner>) {
    let mut attempt: u32 = 0;

    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        let result = run_session(&inner, &mut attempt).await;
        *inner.sink.lock().await = None;

        match result {
            Ok(true) => break, // cancelled
            Ok(false) => {
                // Counter resets, but one initial delay still applies so
                // a flapping server cannot drive a hot redial loop.
                info!("notification stream closed by server, reconnecting");
                attempt = 0;
                tokio::select! {
                    biased;
                    () = inner.cancel.cancelled() => break,
                    () = tokio::time::sleep(inner.config.reconnect.initial_delay) => {}
                }
            }
            Err(e) => {
                warn!(error = %e, attempt, "notification session failed");

                if !inner.config.reconnect.allows_attempt(attempt) {
                    error!(attempt, "reconnection limit reached, giving up");
                    break;
                }

                let delay = inner.config.reconnect.delay_for_attempt(attempt);
                attempt += 1;
                let _ = inner
                    .state_tx
                    .send(SessionState::Reconnecting { attempt });

                tokio::select! {
                    biased;
                    () = inner.cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    if inner.cancel.is_cancelled() {
        let _ = inner.state_tx.send(SessionState::Closed);
    } else {
        let _ = inner.state_tx.send(SessionState::Disconnected);
    }
    debug!("notification supervisor exiting");
}

/// One session. `Ok(true)` means cancellation, `Ok(false)` a clean
/// server-side close.
async fn run_session(inner: &Arc<ConsumerInner>, attempt: &mut u32) -> Result<bool, Error> {
    let url = inner.config.websocket_url()?;

    let _ = inner.state_tx.send(SessionState::Connecting);
    info!(
        host = url.host_str().unwrap_or(""),
        path = url.path(),
        "connecting to notification endpoint"
    );

    // Race the dial against cancellation so close() never waits on a
    // stuck upgrade.
    let ws = tokio::select! {
        biased;
        () = inner.cancel.cancelled() => return Ok(true),
        result = connect_async(url.as_str()) => {
            result.map_err(|e| Error::WebSocketConnect(e.to_string()))?.0
        }
    };

    let (sink, stream) = ws.split();
    *inner.sink.lock().await = Some(sink);

    let _ = inner.state_tx.send(SessionState::Connected);
    *attempt = 0;
    info!("notification stream connected");

    read_loop(inner, stream).await
}

async fn read_loop(inner: &Arc<ConsumerInner>, mut stream: WsSource) -> Result<bool, Error> {
    let mut ping = tokio::time::interval(inner.config.ping_interval);
    ping.tick().await; // consume the immediate first tick
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => return Ok(true),
            _ = ping.tick() => {
                if awaiting_pong {
                    return Err(Error::WebSocketConnect(
                        "no pong since the previous ping".into(),
                    ));
                }
                send_ping(inner).await?;
                awaiting_pong = true;
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let seq = inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
                        let notification = Arc::new(frame::decode(&text, seq));
                        trace!(
                            identifier = %notification.identifier,
                            description = %notification.description,
                            seq,
                            "notification received"
                        );
                        if let Err(mpsc::error::TrySendError::Full(n)) =
                            inner.notification_tx.try_send(notification)
                        {
                            warn!(
                                identifier = %n.identifier,
                                "consumer buffer full, dropping notification \
                                 (left unacked for redelivery)"
                            );
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Ok(WsMessage::Ping(_))) => {
                        // tungstenite replies with pongs automatically
                        trace!("websocket ping");
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            info!(code = %cf.code, reason = %cf.reason, "close frame received");
                        } else {
                            info!("close frame received (no payload)");
                        }
                        return Ok(false);
                    }
                    Some(Err(e)) => {
                        return Err(Error::WebSocketConnect(e.to_string()));
                    }
                    None => {
                        info!("notification stream ended");
                        return Ok(false);
                    }
                    _ => {
                        // Binary, raw frames: not part of this protocol
                    }
                }
            }
        }
    }
}

/// Transport ping with the configured write deadline.
async fn send_ping(inner: &Arc<ConsumerInner>) -> Result<(), Error> {
    let mut guard = inner.sink.lock().await;
    let sink = guard.as_mut().ok_or(Error::NotConnected)?;

    let send = sink.send(WsMessage::Ping(Bytes::new()));
    match tokio::time::timeout(inner.config.write_timeout, send).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::Send(e.to_string())),
        Err(_) => Err(Error::Send("ping write deadline exceeded".into())),
    }
}

// ── Tests ────────────────────────────────────────────────────────────
