// ── Public realtime client ──
//
// Thin concurrency-safe facade over the connection state machine and the
// subscription registry. Cheaply cloneable; every method may be called
// from any task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bayeux::RealtimeMessage;
use crate::config::RealtimeConfig;
use crate::connection::{Connection, SessionState};
use crate::error::Error;
use crate::pattern::ChannelPattern;
use crate::registry::{SubscriptionId, SubscriptionRegistry};

/// Client for the Bayeux realtime endpoint (`/cep/realtime`).
///
/// # Example
///
/// ```rust,ignore
/// use c8y_realtime::{channel, Credentials, RealtimeClient, RealtimeConfig};
///
/// let config = RealtimeConfig::new("https://tenant.cumulocity.com".parse()?, credentials);
/// let client = RealtimeClient::new(config);
///
/// client.connect()?;
/// client.wait_for_connection(Duration::from_secs(30)).await?;
///
/// let mut measurements = client.subscribe(&channel::measurements("*")).await?;
/// while let Some(msg) = measurements.recv().await {
///     println!("{}: {}", msg.channel, msg.payload);
/// }
///
/// client.close().await;
/// ```
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connection: Arc<Connection>,
    registry: Arc<SubscriptionRegistry>,
    state_rx: watch::Receiver<SessionState>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    subscription_buffer: usize,
}

/// Handle to one active subscription.
///
/// Messages matching the pattern arrive on an internal bounded buffer;
/// read them with [`recv`](Self::recv). Dropping the handle prunes the
/// registry entry on the next delivery (send the protocol unsubscribe
/// with [`RealtimeClient::unsubscribe`] if the server should stop too).
pub struct Subscription {
    id: SubscriptionId,
    pattern: String,
    rx: mpsc::Receiver<Arc<RealtimeMessage>>,
}

impl Subscription {
    /// The pattern this subscription was registered with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next matching message. Returns `None` once the
    /// client is closed and the buffer is drained.
    pub async fn recv(&mut self) -> Option<Arc<RealtimeMessage>> {
        self.rx.recv().await
    }

    /// Non-blocking read of the next buffered message.
    pub fn try_recv(&mut self) -> Option<Arc<RealtimeMessage>> {
        self.rx.try_recv().ok()
    }
}

impl RealtimeClient {
    /// Create a client. Does NOT connect -- call
    /// [`connect()`](Self::connect) to start the session.
    pub fn new(config: RealtimeConfig) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let subscription_buffer = config.subscription_buffer;
        let (connection, state_rx) = Connection::new(config, Arc::clone(&registry));

        Self {
            inner: Arc::new(ClientInner {
                connection,
                registry,
                state_rx,
                supervisor: Mutex::new(None),
                started: AtomicBool::new(false),
                subscription_buffer,
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start connecting. Idempotent: a second call while the supervisor
    /// is running is a no-op.
    ///
    /// Returns immediately; the session is established asynchronously.
    /// Use [`wait_for_connection`](Self::wait_for_connection) to block
    /// until it is up. A bad endpoint URL is reported here, before any
    /// task is spawned.
    pub async fn connect(&self) -> Result<(), Error> {
        if self.inner.connection.is_closed() {
            return Err(Error::Closed);
        }
        self.inner.connection.validate_config()?;

        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("connect() called while already running, ignoring");
            return Ok(());
        }

        let handle = self.inner.connection.spawn_supervisor();
        *self.inner.supervisor.lock().await = Some(handle);
        Ok(())
    }

    /// Block until the session reaches `Connected`, the client is
    /// closed, or `timeout` elapses. Wakes on state edges; no polling.
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

    /// Returns `true` while the session is live.
    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.connection.state()
    }

    /// Subscribe to connection state changes.
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.inner.state_rx.clone()
    }

    /// Shut down: best-effort protocol disconnect, stop the supervisor
    /// and keepalive, release the socket. Idempotent -- a second call is
    /// a no-op, not an error.
    pub async fn close(&self) {
        self.inner.connection.close().await;

        if let Some(handle) = self.inner.supervisor.lock().await.take() {
            let _ = handle.await;
        }
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Subscribe to a channel pattern, e.g. `/measurements/*`.
    ///
    /// Compiles the pattern, registers the destination, and sends the
    /// protocol subscribe frame. Fails if the pattern is invalid or the
    /// session is not currently connected.
    pub async fn subscribe(&self, pattern: &str) -> Result<Subscription, Error> {
        self.subscribe_with_buffer(pattern, self.inner.subscription_buffer)
            .await
    }

    /// [`subscribe`](Self::subscribe) with an explicit delivery buffer
    /// size for this subscription.
    pub async fn subscribe_with_buffer(
        &self,
        pattern: &str,
        buffer: usize,
    ) -> Result<Subscription, Error> {
        if self.inner.connection.is_closed() {
            return Err(Error::Closed);
        }

        let matcher = ChannelPattern::compile(pattern)?;
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = self.inner.registry.register(matcher, tx);

        if let Err(e) = self.inner.connection.send_subscribe(pattern).await {
            self.inner.registry.remove(id);
            return Err(e);
        }

        Ok(Subscription {
            id,
            pattern: pattern.to_string(),
            rx,
        })
    }

    /// Drop the subscription for a pattern and tell the server.
    ///
    /// The local entry is always removed; the protocol unsubscribe is
    /// best-effort and a disconnected session is not an error.
    pub async fn unsubscribe(&self, pattern: &str) -> Result<(), Error> {
        let Some(_id) = self.inner.registry.remove_by_pattern(pattern) else {
            return Err(Error::SubscriptionNotFound {
                pattern: pattern.to_string(),
            });
        };

        match self.inner.connection.send_unsubscribe(pattern).await {
            Ok(()) | Err(Error::NotConnected | Error::Closed) => Ok(()),
            Err(e) => {
                warn!(%pattern, error = %e, "protocol unsubscribe failed (entry removed locally)");
                Ok(())
            }
        }
    }

    /// Drop every subscription. Local entries are always removed; any
    /// frame-send failures are collected and returned.
    pub async fn unsubscribe_all(&self) -> Vec<Error> {
        let mut errors = Vec::new();

        for pattern in self.inner.registry.clear() {
            match self.inner.connection.send_unsubscribe(&pattern).await {
                Ok(()) | Err(Error::NotConnected | Error::Closed) => {}
                Err(e) => errors.push(e),
            }
        }

        errors
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use secrecy::SecretString;
    use url::Url;

    use super::*;
    use crate::config::Credentials;

    fn client() -> RealtimeClient {
        let config = RealtimeConfig::new(
            Url::parse("http://127.0.0.1:1").unwrap(),
            Credentials::Basic {
                tenant: "t1".into(),
                username: "u".into(),
                password: SecretString::from("p".to_string()),
            },
        );
        RealtimeClient::new(config)
    }

    #[tokio::test]
    async fn subscribe_while_never_connected_is_an_error() {
        let client = client();

        let result = client.subscribe("/alarms/*").await;
        assert!(matches!(result, Err(Error::NotConnected)));

        // The failed subscribe must not leave a registry entry behind.
        assert!(client.inner.registry.is_empty());
    }

    #[tokio::test]
    async fn subscribe_rejects_bad_patterns_before_touching_the_wire() {
        let client = client();
        let result = client.subscribe("/alarms/12*").await;
        assert!(matches!(result, Err(Error::InvalidPattern { .. })));
    }

    #[tokio::test]
    async fn unsubscribe_unknown_pattern_is_an_error() {
        let client = client();
        let result = client.unsubscribe("/alarms/*").await;
        assert!(matches!(result, Err(Error::SubscriptionNotFound { .. })));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_use() {
        let client = client();
        client.connect().await.unwrap();

        client.close().await;
        client.close().await; // second close is a no-op

        assert!(client.state().is_closed());
        assert!(matches!(client.connect().await, Err(Error::Closed)));
        assert!(matches!(
            client.subscribe("/alarms/*").await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn wait_for_connection_times_out_without_a_server() {
        let client = client();
        client.connect().await.unwrap();

        let result = client
            .wait_for_connection(Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));

        client.close().await;
    }
}
