use thiserror::Error;

/// Top-level error type for the `c8y-realtime` crate.
///
/// Covers every failure mode across both client variants: the Bayeux
/// realtime channel and the notification2 consumer stream. Connection-level
/// failures are retried internally; only usage errors and per-operation
/// failures surface through `Result` returns.
#[derive(Debug, Error)]
pub enum Error {
    // ── Usage ───────────────────────────────────────────────────────
    /// Subscription pattern failed to compile.
    #[error("Invalid channel pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// No subscription registered for the given pattern.
    #[error("No active subscription for pattern {pattern:?}")]
    SubscriptionNotFound { pattern: String },

    /// Operation attempted while the connection is down (including a
    /// caller racing with an in-progress reconnect).
    #[error("Not connected to the realtime endpoint")]
    NotConnected,

    /// Operation attempted after [`close`](crate::RealtimeClient::close).
    #[error("Client has been closed")]
    Closed,

    /// [`wait_for_connection`](crate::RealtimeClient::wait_for_connection)
    /// gave up before the session came up.
    #[error("Timed out after {timeout_secs}s waiting for connection")]
    Timeout { timeout_secs: u64 },

    // ── Configuration ───────────────────────────────────────────────
    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Endpoint URL scheme is not http/https/ws/wss.
    #[error("Unsupported URL scheme {scheme:?} -- expected http(s) or ws(s)")]
    UnsupportedScheme { scheme: String },

    // ── Connection ──────────────────────────────────────────────────
    /// WebSocket dial or upgrade failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// Handshake rejected, or the reply carried no client id.
    #[error("Handshake failed: {reason}")]
    Handshake { reason: String },

    /// Writing a frame to the socket failed.
    #[error("Failed to send frame: {0}")]
    Send(String),

    // ── Protocol ────────────────────────────────────────────────────
    /// Malformed or unexpected inbound frame.
    #[error("Protocol error: {message}")]
    Protocol { message: String },
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WebSocketConnect(_)
                | Self::Handshake { .. }
                | Self::Send(_)
                | Self::NotConnected
                | Self::Timeout { .. }
        )
    }

    /// Returns `true` if this error means the client can never recover
    /// (closed, or a configuration problem the caller must fix).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Closed
                | Self::InvalidUrl(_)
                | Self::UnsupportedScheme { .. }
                | Self::InvalidPattern { .. }
        )
    }
}
