// ── Bayeux frame codec ──
//
// Pure transform between protocol structs and the wire representation:
// outbound requests serialize to a JSON array containing one object, and
// an inbound frame is a JSON array that may batch several messages.
// Correlation ids are assigned by the connection's atomic counter and
// rendered as decimal strings.

use serde::{Deserialize, Serialize};

use crate::config::Credentials;
use crate::error::Error;

/// Bayeux protocol version advertised in the handshake.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Connection types this client supports.
pub const CONNECTION_TYPE: &str = "websocket";

// ── Meta channels ────────────────────────────────────────────────────

pub mod meta {
    pub const HANDSHAKE: &str = "/meta/handshake";
    pub const CONNECT: &str = "/meta/connect";
    pub const SUBSCRIBE: &str = "/meta/subscribe";
    pub const UNSUBSCRIBE: &str = "/meta/unsubscribe";
    pub const DISCONNECT: &str = "/meta/disconnect";

    /// Returns `true` for any `/meta/...` control channel.
    pub fn is_meta(channel: &str) -> bool {
        channel.starts_with("/meta/")
    }
}

// ── Data channel builders ────────────────────────────────────────────

/// Well-known realtime data channel names. An empty or absent id
/// subscribes to all objects of the kind (`*`).
pub mod channel {
    fn build(prefix: &str, id: &str) -> String {
        let id = if id.is_empty() { "*" } else { id };
        format!("/{prefix}/{id}")
    }

    pub fn alarms(id: &str) -> String {
        build("alarms", id)
    }

    pub fn alarms_with_children(id: &str) -> String {
        build("alarmsWithChildren", id)
    }

    pub fn events(id: &str) -> String {
        build("events", id)
    }

    pub fn managed_objects(id: &str) -> String {
        build("managedobjects", id)
    }

    pub fn measurements(id: &str) -> String {
        build("measurements", id)
    }

    pub fn operations(id: &str) -> String {
        build("operations", id)
    }
}

// ── Realtime actions ─────────────────────────────────────────────────

/// What happened to the object a message describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RealtimeAction {
    Create,
    Update,
    Delete,
}

impl std::str::FromStr for RealtimeAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(Error::Protocol {
                message: format!("unknown realtime action {other:?}"),
            }),
        }
    }
}

impl std::fmt::Display for RealtimeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => f.write_str("CREATE"),
            Self::Update => f.write_str("UPDATE"),
            Self::Delete => f.write_str("DELETE"),
        }
    }
}

// ── Advice ───────────────────────────────────────────────────────────

/// Timeout/interval hints exchanged on meta channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
}

// ── Outbound frames ──────────────────────────────────────────────────

/// One outbound protocol request. Serialized as `[{...}]` on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    pub channel: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
}

impl RequestFrame {
    fn bare(channel: &str, id: String) -> Self {
        Self {
            channel: channel.to_string(),
            id,
            client_id: None,
            version: None,
            minimum_version: None,
            supported_connection_types: None,
            connection_type: None,
            subscription: None,
            ext: None,
            advice: None,
        }
    }

    /// `/meta/handshake` request with the authentication extension.
    pub fn handshake(id: String, credentials: &Credentials) -> Self {
        Self {
            version: Some(PROTOCOL_VERSION.to_string()),
            minimum_version: Some(PROTOCOL_VERSION.to_string()),
            supported_connection_types: Some(vec![
                CONNECTION_TYPE.to_string(),
                "long-polling".to_string(),
            ]),
            ext: Some(credentials.auth_ext()),
            ..Self::bare(meta::HANDSHAKE, id)
        }
    }

    /// `/meta/connect` keepalive request.
    pub fn connect(id: String, client_id: String, advice: Advice) -> Self {
        Self {
            client_id: Some(client_id),
            connection_type: Some(CONNECTION_TYPE.to_string()),
            advice: Some(advice),
            ..Self::bare(meta::CONNECT, id)
        }
    }

    /// `/meta/subscribe` request for a channel pattern.
    pub fn subscribe(id: String, client_id: String, pattern: &str) -> Self {
        Self {
            client_id: Some(client_id),
            subscription: Some(pattern.to_string()),
            ..Self::bare(meta::SUBSCRIBE, id)
        }
    }

    /// `/meta/unsubscribe` request for a channel pattern.
    pub fn unsubscribe(id: String, client_id: String, pattern: &str) -> Self {
        Self {
            client_id: Some(client_id),
            subscription: Some(pattern.to_string()),
            ..Self::bare(meta::UNSUBSCRIBE, id)
        }
    }

    /// `/meta/disconnect` request.
    pub fn disconnect(id: String, client_id: String) -> Self {
        Self {
            client_id: Some(client_id),
            ..Self::bare(meta::DISCONNECT, id)
        }
    }

    /// Encode to the wire representation: a JSON array of one object.
    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(&[self]).map_err(|e| Error::Protocol {
            message: format!("failed to encode {} frame: {e}", self.channel),
        })
    }
}

// ── Inbound frames ───────────────────────────────────────────────────

/// One inbound message. A wire frame carries an array of these -- the
/// server may batch several logical messages in one write.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyFrame {
    pub channel: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub successful: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub advice: Option<Advice>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl ReplyFrame {
    /// Returns `true` for meta-channel control replies.
    pub fn is_meta(&self) -> bool {
        meta::is_meta(&self.channel)
    }
}

/// Decode one wire frame into its batched messages.
pub fn decode_frame(text: &str) -> Result<Vec<ReplyFrame>, Error> {
    serde_json::from_str(text).map_err(|e| Error::Protocol {
        message: format!("malformed inbound frame: {e}"),
    })
}

// ── Delivered data messages ──────────────────────────────────────────

/// Shape of the `data` field on realtime data channels:
/// `{"realtimeAction": "UPDATE", "data": {...}}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeData {
    #[serde(default)]
    realtime_action: Option<RealtimeAction>,
    #[serde(default)]
    data: serde_json::Value,
}

/// One data message as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct RealtimeMessage {
    /// Channel the message arrived on, e.g. `/measurements/12345`.
    pub channel: String,
    /// What happened to the object, when the server says.
    pub action: Option<RealtimeAction>,
    /// The object payload.
    pub payload: serde_json::Value,
    /// Delivery sequence number, monotonic per connection. Diagnostics
    /// only -- carries no ordering guarantee beyond the transport's.
    pub seq: u64,
}

impl RealtimeMessage {
    /// Build a delivered message from a data-channel reply.
    pub(crate) fn from_reply(reply: &ReplyFrame, seq: u64) -> Self {
        let data = reply.data.clone().unwrap_or(serde_json::Value::Null);
        match serde_json::from_value::<RealtimeData>(data.clone()) {
            Ok(parsed) if parsed.realtime_action.is_some() => Self {
                channel: reply.channel.clone(),
                action: parsed.realtime_action,
                payload: parsed.data,
                seq,
            },
            // No recognizable action envelope: hand the raw data through.
            _ => Self {
                channel: reply.channel.clone(),
                action: None,
                payload: data,
                seq,
            },
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
