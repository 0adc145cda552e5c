// ── notification2: consumer-protocol client ──
//
// The notification2 endpoint delivers line-oriented text frames over a
// token-authenticated WebSocket and expects per-message acks. Shares the
// backoff policy and session states with the Bayeux client.

mod consumer;
mod frame;

pub use consumer::Notification2Client;
pub use frame::{Notification, SharedNotification};
