// ── Runtime connection configuration ──
//
// These types describe *how* to reach a realtime endpoint. They carry
// credential material and connection tuning, but never touch disk -- the
// embedding application constructs a config and hands it in.

use std::time::Duration;

use base64::prelude::*;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use url::Url;

use crate::backoff::ReconnectConfig;
use crate::error::Error;

/// Path suffix of the Bayeux realtime endpoint.
pub const REALTIME_PATH: &str = "/cep/realtime";

/// Path suffix of the notification2 consumer endpoint.
pub const CONSUMER_PATH: &str = "/notification2/consumer/";

/// Credentials for the Bayeux handshake `ext` extension.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Tenant-scoped basic auth. Encoded as base64 of
    /// `tenant/username:password` inside the handshake extension.
    Basic {
        tenant: String,
        username: String,
        password: SecretString,
    },

    /// Bearer token, passed through the handshake extension verbatim.
    Bearer { token: SecretString },
}

impl Credentials {
    /// Build the `ext` authentication blob for the handshake frame.
    pub(crate) fn auth_ext(&self) -> serde_json::Value {
        let token = match self {
            Self::Basic {
                tenant,
                username,
                password,
            } => {
                let raw = format!("{tenant}/{username}:{}", password.expose_secret());
                BASE64_STANDARD.encode(raw)
            }
            Self::Bearer { token } => token.expose_secret().to_string(),
        };
        json!({ "com.cumulocity.authn": { "token": token } })
    }
}

/// Configuration for a [`RealtimeClient`](crate::RealtimeClient).
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Platform base URL, e.g. `https://tenant.cumulocity.com`.
    /// `http`/`https` schemes are upgraded to `ws`/`wss`.
    pub base_url: Url,
    /// Handshake credentials.
    pub credentials: Credentials,
    /// Reconnection backoff policy.
    pub reconnect: ReconnectConfig,
    /// How often inbound silence is checked while connected.
    pub keepalive_interval: Duration,
    /// Maximum inbound silence before the connection is declared dead.
    pub keepalive_timeout: Duration,
    /// Per-subscription delivery buffer. When a subscriber's buffer is
    /// full, further messages for it are dropped and logged.
    pub subscription_buffer: usize,
}

impl RealtimeConfig {
    /// Config with default tuning for the given endpoint and credentials.
    pub fn new(base_url: Url, credentials: Credentials) -> Self {
        Self {
            base_url,
            credentials,
            reconnect: ReconnectConfig::default(),
            keepalive_interval: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(180),
            subscription_buffer: 256,
        }
    }

    /// The derived WebSocket URL for the Bayeux endpoint.
    pub fn websocket_url(&self) -> Result<Url, Error> {
        websocket_url(&self.base_url, REALTIME_PATH)
    }
}

/// Configuration for a [`Notification2Client`](crate::Notification2Client).
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Platform base URL.
    pub base_url: Url,
    /// Subscription bearer token (`token` query parameter, required).
    pub token: SecretString,
    /// Consumer/session identifier (`consumer` query parameter, optional).
    /// Reusing an identifier resumes the server-side consumer queue.
    pub consumer: Option<String>,
    /// Reconnection backoff policy (5s floor by default).
    pub reconnect: ReconnectConfig,
    /// Interval between WebSocket pings.
    pub ping_interval: Duration,
    /// Write deadline for each ping (and for acks).
    pub write_timeout: Duration,
    /// Delivery buffer for the notification stream.
    pub buffer: usize,
}

impl ConsumerConfig {
    /// Config with default tuning for the given endpoint and token.
    pub fn new(base_url: Url, token: SecretString) -> Self {
        Self {
            base_url,
            token,
            consumer: None,
            reconnect: ReconnectConfig::consumer(),
            ping_interval: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            buffer: 256,
        }
    }

    /// The derived WebSocket URL, including `token` and `consumer`
    /// query parameters.
    pub fn websocket_url(&self) -> Result<Url, Error> {
        let mut url = websocket_url(&self.base_url, CONSUMER_PATH)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("token", self.token.expose_secret());
            if let Some(ref consumer) = self.consumer {
                query.append_pair("consumer", consumer);
            }
        }
        Ok(url)
    }
}

/// Derive a WebSocket URL from a platform base URL and an endpoint path.
///
/// `http` → `ws`, `https` → `wss`; existing `ws`/`wss` pass through.
fn websocket_url(base: &Url, path: &str) -> Result<Url, Error> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::UnsupportedScheme {
                scheme: other.to_string(),
            });
        }
    };

    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|()| Error::UnsupportedScheme {
            scheme: scheme.to_string(),
        })?;
    url.set_path(path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

// ── Tests ────────────────────────────────────────────────────────────
