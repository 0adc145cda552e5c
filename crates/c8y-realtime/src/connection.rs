// ── Bayeux connection state machine ──
//
// One supervisor task owns the full socket lifecycle: dial, handshake,
// read loop, keepalive, reconnect with backoff, shutdown. The write half
// and the server-assigned client id live behind a single mutex so a
// caller can never observe a sink without its client id, and a reconnect
// fully retires the previous socket before a new one appears.
//
// State writes happen only here and in `close`; the public API observes
// state through a watch channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::bayeux::{Advice, RealtimeMessage, ReplyFrame, RequestFrame, decode_frame, meta};
use crate::config::RealtimeConfig;
use crate::error::Error;
use crate::registry::SubscriptionRegistry;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Advice sent on `/meta/connect`: how long the server may hold the
/// long-poll, and how quickly we come back after a reply.
const CONNECT_TIMEOUT_MS: u64 = 60_000;
const CONNECT_INTERVAL_MS: u64 = 0;

// ── SessionState ─────────────────────────────────────────────────────

/// Connection lifecycle state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

impl SessionState {
    /// Returns `true` if the session is live.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns `true` once [`close`](crate::RealtimeClient::close) has run.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Connecting => f.write_str("Connecting"),
            Self::Handshaking => f.write_str("Handshaking"),
            Self::Connected => f.write_str("Connected"),
            Self::Reconnecting { attempt } => write!(f, "Reconnecting (attempt {attempt})"),
            Self::Closed => f.write_str("Closed"),
        }
    }
}

// ── Connection ───────────────────────────────────────────────────────

/// Write half plus the client id assigned during its handshake.
struct Link {
    sink: WsSink,
    client_id: String,
}

pub(crate) struct Connection {
    config: RealtimeConfig,
    registry: Arc<SubscriptionRegistry>,
    state_tx: watch::Sender<SessionState>,
    link: Mutex<Option<Link>>,
    correlation: AtomicU64,
    seq: AtomicU64,
    cancel: CancellationToken,
}

/// How a session ended, when it ended without a transport error.
enum SessionEnd {
    /// Server sent a close frame or the stream drained.
    ServerClosed,
    /// Cancellation observed (close() was called).
    Cancelled,
}

impl Connection {
    pub fn new(
        config: RealtimeConfig,
        registry: Arc<SubscriptionRegistry>,
    ) -> (Arc<Self>, watch::Receiver<SessionState>) {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let connection = Arc::new(Self {
            config,
            registry,
            state_tx,
            link: Mutex::new(None),
            correlation: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        (connection, state_rx)
    }

    /// Spawn the supervisor task that drives the reconnect loop.
    pub fn spawn_supervisor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let connection = Arc::clone(self);
        tokio::spawn(async move { connection.run().await })
    }

    /// Check the endpoint URL up front so a bad config fails the
    /// `connect()` call instead of looping forever in the supervisor.
    pub fn validate_config(&self) -> Result<(), Error> {
        self.config.websocket_url().map(|_| ())
    }

    pub fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&self, state: SessionState) {
        let _ = self.state_tx.send(state);
    }

    /// Next correlation id for an outbound frame.
    fn next_id(&self) -> String {
        (self.correlation.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Next delivery sequence number.
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ── Outbound frames (public API path) ────────────────────────────

    /// Send a frame built from (correlation id, client id).
    ///
    /// A `None` link means the socket is down or mid-reconnect: the
    /// caller gets [`Error::NotConnected`], never a dangling handle.
    async fn send_with_link<F>(&self, build: F) -> Result<(), Error>
    where
        F: FnOnce(String, String) -> RequestFrame,
    {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(Error::NotConnected)?;
        let frame = build(self.next_id(), link.client_id.clone());
        let text = frame.encode()?;
        link.sink
            .send(WsMessage::text(text))
            .await
            .map_err(|e| Error::Send(e.to_string()))
    }

    pub async fn send_subscribe(&self, pattern: &str) -> Result<(), Error> {
        debug!(%pattern, "subscribing");
        self.send_with_link(|id, client_id| RequestFrame::subscribe(id, client_id, pattern))
            .await
    }

    pub async fn send_unsubscribe(&self, pattern: &str) -> Result<(), Error> {
        debug!(%pattern, "unsubscribing");
        self.send_with_link(|id, client_id| RequestFrame::unsubscribe(id, client_id, pattern))
            .await
    }

    /// Shut the connection down. Idempotent: repeat calls are no-ops.
    ///
    /// Sends a best-effort `/meta/disconnect` and a close frame, cancels
    /// the supervisor, and releases the socket.
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();

        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_mut() {
            let frame = RequestFrame::disconnect(self.next_id(), link.client_id.clone());
            if let Ok(text) = frame.encode() {
                let _ = link.sink.send(WsMessage::text(text)).await;
            }
            let _ = link.sink.send(WsMessage::Close(None)).await;
        }
        *guard = None;
        drop(guard);

        self.set_state(SessionState::Closed);
        info!("realtime connection closed");
    }

    // ── Supervisor ───────────────────────────────────────────────────

    async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let result = self.run_session(&mut attempt).await;

            // Retire the socket before anything else can race with it.
            *self.link.lock().await = None;

            match result {
                Ok(SessionEnd::Cancelled) => break,
                Ok(SessionEnd::ServerClosed) => {
                    // Clean disconnect: counter resets, but one initial
                    // delay still applies so a flapping server cannot
                    // drive a hot redial loop.
                    info!("server closed the realtime stream, reconnecting");
                    attempt = 0;
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(self.config.reconnect.initial_delay) => {}
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "unrecoverable realtime error, giving up");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "realtime session failed");

                    if !self.config.reconnect.allows_attempt(attempt) {
                        error!(attempt, "reconnection limit reached, giving up");
                        break;
                    }

                    let delay = self.config.reconnect.delay_for_attempt(attempt);
                    attempt += 1;
                    self.set_state(SessionState::Reconnecting { attempt });
                    debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                           attempt, "waiting before reconnect");

                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if self.cancel.is_cancelled() {
            self.set_state(SessionState::Closed);
        } else {
            self.set_state(SessionState::Disconnected);
        }
        debug!("realtime supervisor exiting");
    }

    /// One full session: dial, handshake, deliver until the socket dies.
    async fn run_session(&self, attempt: &mut u32) -> Result<SessionEnd, Error> {
        let url = self.config.websocket_url()?;

        self.set_state(SessionState::Connecting);
        info!(url = %url, "connecting to realtime endpoint");

        // The dial can stall indefinitely against a host that accepts TCP
        // but never answers the upgrade; close() must still return, so the
        // whole dial+handshake races against cancellation.
        let establish = async {
            let (mut ws, _response) = connect_async(url.as_str())
                .await
                .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

            self.set_state(SessionState::Handshaking);

            let handshake = RequestFrame::handshake(self.next_id(), &self.config.credentials);
            ws.send(WsMessage::text(handshake.encode()?))
                .await
                .map_err(|e| Error::Send(e.to_string()))?;

            let client_id = await_handshake(&mut ws).await?;
            Ok::<_, Error>((ws, client_id))
        };

        let (ws, client_id) = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            result = establish => result?,
        };
        debug!(%client_id, "handshake complete");

        let (sink, stream) = ws.split();
        *self.link.lock().await = Some(Link { sink, client_id });

        self.set_state(SessionState::Connected);
        *attempt = 0;

        // Server-side subscription state does not survive a reconnect:
        // replay every active pattern on the fresh session.
        for pattern in self.registry.patterns() {
            self.send_subscribe(&pattern).await?;
        }
        self.send_connect_frame().await?;

        self.connected_loop(stream).await
    }

    /// Keepalive `/meta/connect` long-poll request.
    async fn send_connect_frame(&self) -> Result<(), Error> {
        let advice = Advice {
            reconnect: None,
            timeout: Some(CONNECT_TIMEOUT_MS),
            interval: Some(CONNECT_INTERVAL_MS),
        };
        self.send_with_link(|id, client_id| RequestFrame::connect(id, client_id, advice))
            .await
    }

    /// Re-handshake on the live socket (server advice `reconnect: handshake`).
    async fn send_handshake_frame(&self) -> Result<(), Error> {
        let frame = RequestFrame::handshake(self.next_id(), &self.config.credentials);
        let text = frame.encode()?;
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(Error::NotConnected)?;
        link.sink
            .send(WsMessage::text(text))
            .await
            .map_err(|e| Error::Send(e.to_string()))
    }

    /// Deliver frames until the socket dies.
    ///
    /// Exactly one `/meta/connect` long-poll is outstanding at a time:
    /// the initial one is sent by `run_session` and each reply re-arms
    /// the next in `handle_meta`. The interval here is only a silence
    /// watchdog; it never sends.
    async fn connected_loop(&self, mut stream: WsSource) -> Result<SessionEnd, Error> {
        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.tick().await; // consume the immediate first tick
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                _ = keepalive.tick() => {
                    if last_inbound.elapsed() > self.config.keepalive_timeout {
                        return Err(Error::WebSocketConnect(format!(
                            "no inbound frames for {}s",
                            self.config.keepalive_timeout.as_secs()
                        )));
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            last_inbound = Instant::now();
                            self.handle_frame(&text).await?;
                        }
                        Some(Ok(WsMessage::Ping(_))) => {
                            // tungstenite replies with pongs automatically
                            last_inbound = Instant::now();
                            trace!("websocket ping");
                        }
                        Some(Ok(WsMessage::Pong(_))) => {
                            last_inbound = Instant::now();
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            if let Some(ref cf) = frame {
                                info!(code = %cf.code, reason = %cf.reason, "close frame received");
                            } else {
                                info!("close frame received (no payload)");
                            }
                            return Ok(SessionEnd::ServerClosed);
                        }
                        Some(Err(e)) => {
                            return Err(Error::WebSocketConnect(e.to_string()));
                        }
                        None => {
                            info!("realtime stream ended");
                            return Ok(SessionEnd::ServerClosed);
                        }
                        _ => {
                            // Binary, raw frames: not part of this protocol
                        }
                    }
                }
            }
        }
    }

    /// Decode one wire frame and dispatch its batched messages.
    ///
    /// Malformed frames are logged and dropped; they never tear the
    /// connection down.
    async fn handle_frame(&self, text: &str) -> Result<(), Error> {
        let replies = match decode_frame(text) {
            Ok(replies) => replies,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return Ok(());
            }
        };

        for reply in replies {
            if reply.is_meta() {
                self.handle_meta(reply).await?;
            } else {
                let message = Arc::new(RealtimeMessage::from_reply(&reply, self.next_seq()));
                self.registry.route(&message);
            }
        }
        Ok(())
    }

    async fn handle_meta(&self, reply: ReplyFrame) -> Result<(), Error> {
        match reply.channel.as_str() {
            meta::CONNECT => {
                if reply.successful == Some(false) {
                    if advice_wants_handshake(&reply) {
                        info!("server requested re-handshake");
                        self.send_handshake_frame().await?;
                        return Ok(());
                    }
                    return Err(Error::Protocol {
                        message: format!(
                            "connect rejected: {}",
                            reply.error.as_deref().unwrap_or("no reason given")
                        ),
                    });
                }
                // Long-poll fulfilled: immediately re-arm it.
                self.send_connect_frame().await?;
            }
            meta::HANDSHAKE => {
                // Reply to an in-session re-handshake.
                let client_id = handshake_client_id(reply)?;
                debug!(%client_id, "re-handshake complete");
                {
                    let mut guard = self.link.lock().await;
                    let link = guard.as_mut().ok_or(Error::NotConnected)?;
                    link.client_id = client_id;
                }
                for pattern in self.registry.patterns() {
                    self.send_subscribe(&pattern).await?;
                }
                self.send_connect_frame().await?;
            }
            meta::SUBSCRIBE | meta::UNSUBSCRIBE => {
                if reply.successful == Some(false) {
                    warn!(
                        channel = %reply.channel,
                        subscription = reply.subscription.as_deref().unwrap_or(""),
                        error = reply.error.as_deref().unwrap_or("no reason given"),
                        "subscription change rejected by server"
                    );
                } else {
                    trace!(
                        channel = %reply.channel,
                        subscription = reply.subscription.as_deref().unwrap_or(""),
                        "subscription change acknowledged"
                    );
                }
            }
            meta::DISCONNECT => {
                debug!("disconnect acknowledged");
            }
            other => {
                debug!(channel = %other, "ignoring unknown meta reply");
            }
        }
        Ok(())
    }
}

// ── Handshake helpers ────────────────────────────────────────────────

/// Read frames until the handshake reply arrives, then extract the
/// client id. Bounded by [`HANDSHAKE_TIMEOUT`].
async fn await_handshake(ws: &mut WsStream) -> Result<String, Error> {
    let wait = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        while let Some(frame) = ws.next().await {
            let frame = frame.map_err(|e| Error::WebSocketConnect(e.to_string()))?;
            match frame {
                WsMessage::Text(text) => {
                    let replies = match decode_frame(&text) {
                        Ok(replies) => replies,
                        Err(e) => {
                            warn!(error = %e, "dropping malformed frame during handshake");
                            continue;
                        }
                    };
                    for reply in replies {
                        if reply.channel == meta::HANDSHAKE {
                            return handshake_client_id(reply);
                        }
                    }
                }
                WsMessage::Close(_) => {
                    return Err(Error::Handshake {
                        reason: "connection closed during handshake".into(),
                    });
                }
                _ => {}
            }
        }
        Err(Error::Handshake {
            reason: "stream ended during handshake".into(),
        })
    })
    .await;

    wait.map_err(|_| Error::Handshake {
        reason: "timed out waiting for handshake reply".into(),
    })?
}

/// A handshake reply must be successful and carry a non-empty client id.
/// Anything else is a recoverable error, never a reason to abort the
/// process.
fn handshake_client_id(reply: ReplyFrame) -> Result<String, Error> {
    if reply.successful == Some(false) {
        return Err(Error::Handshake {
            reason: reply
                .error
                .unwrap_or_else(|| "server rejected handshake".into()),
        });
    }
    reply
        .client_id
        .filter(|id| !id.is_empty())
        .ok_or(Error::Handshake {
            reason: "handshake reply carried no client id".into(),
        })
}

fn advice_wants_handshake(reply: &ReplyFrame) -> bool {
    reply
        .advice
        .as_ref()
        .and_then(|a| a.reconnect.as_deref())
        .is_some_and(|r| r == "handshake")
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn reply(json: serde_json::Value) -> ReplyFrame {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn handshake_reply_with_client_id_is_accepted() {
        let id = handshake_client_id(reply(serde_json::json!({
            "channel": "/meta/handshake",
            "successful": true,
            "clientId": "abc123"
        })))
        .unwrap();
        assert_eq!(id, "abc123");
    }

    #[test]
    fn missing_client_id_is_an_error_not_a_panic() {
        let err = handshake_client_id(reply(serde_json::json!({
            "channel": "/meta/handshake",
            "successful": true
        })))
        .unwrap_err();
        assert!(matches!(err, Error::Handshake { ref reason } if reason.contains("client id")));

        let err = handshake_client_id(reply(serde_json::json!({
            "channel": "/meta/handshake",
            "successful": true,
            "clientId": ""
        })))
        .unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));
    }

    #[test]
    fn rejected_handshake_carries_server_reason() {
        let err = handshake_client_id(reply(serde_json::json!({
            "channel": "/meta/handshake",
            "successful": false,
            "error": "403::invalid credentials"
        })))
        .unwrap_err();
        assert!(matches!(err, Error::Handshake { ref reason } if reason.contains("403")));
    }

    #[test]
    fn handshake_advice_is_detected() {
        let with = reply(serde_json::json!({
            "channel": "/meta/connect",
            "successful": false,
            "advice": { "reconnect": "handshake" }
        }));
        assert!(advice_wants_handshake(&with));

        let without = reply(serde_json::json!({
            "channel": "/meta/connect",
            "successful": false,
            "advice": { "reconnect": "retry" }
        }));
        assert!(!advice_wants_handshake(&without));
    }

    #[test]
    fn session_state_predicates() {
        assert!(SessionState::Connected.is_connected());
        assert!(!SessionState::Reconnecting { attempt: 1 }.is_connected());
        assert!(SessionState::Closed.is_closed());
        assert_eq!(
            SessionState::Reconnecting { attempt: 3 }.to_string(),
            "Reconnecting (attempt 3)"
        );
    }
}
