// c8y-realtime: realtime (Bayeux/CometD) subscription client for Cumulocity IoT.
//
// Two client variants over one set of parts:
//  - `RealtimeClient`: the Bayeux realtime channel (`/cep/realtime`) with
//    handshake/connect/subscribe multiplexing and glob-pattern routing.
//  - `Notification2Client`: the notification2 consumer stream with
//    per-message acknowledgements.

pub mod backoff;
pub mod bayeux;
pub mod client;
pub mod config;
pub mod error;
pub mod notification2;
pub mod pattern;

mod connection;
mod registry;

// ── Primary re-exports ──────────────────────────────────────────────
pub use backoff::ReconnectConfig;
pub use bayeux::{RealtimeAction, RealtimeMessage, channel};
pub use client::{RealtimeClient, Subscription};
pub use config::{ConsumerConfig, Credentials, RealtimeConfig};
pub use connection::SessionState;
pub use error::Error;
pub use notification2::{Notification, Notification2Client};
pub use pattern::ChannelPattern;
pub use registry::SubscriptionId;
