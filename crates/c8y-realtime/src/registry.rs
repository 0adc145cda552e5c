// ── Subscription registry ──
//
// Tracks (pattern, destination) pairs and fans inbound data messages out
// to every matching subscriber. Routing never blocks: each destination is
// a bounded mpsc sender and overflow drops the message with a warning,
// so one slow subscriber cannot stall the read loop or its peers.
//
// The registry holds its own lock, separate from the socket lock -- it is
// never held across network I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bayeux::RealtimeMessage;
use crate::pattern::ChannelPattern;

/// Opaque handle to one registered subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Entry {
    id: SubscriptionId,
    matcher: ChannelPattern,
    tx: mpsc::Sender<Arc<RealtimeMessage>>,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: RwLock<Vec<Entry>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a compiled (matcher, destination) pair.
    pub fn register(
        &self,
        matcher: ChannelPattern,
        tx: mpsc::Sender<Arc<RealtimeMessage>>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Entry { id, matcher, tx });
        id
    }

    /// Remove one entry by id. Returns its pattern if it existed.
    pub fn remove(&self, id: SubscriptionId) -> Option<String> {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let pos = entries.iter().position(|e| e.id == id)?;
        Some(entries.swap_remove(pos).matcher.as_str().to_string())
    }

    /// Remove the first entry matching the given pattern string.
    pub fn remove_by_pattern(&self, pattern: &str) -> Option<SubscriptionId> {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let pos = entries.iter().position(|e| e.matcher.as_str() == pattern)?;
        Some(entries.swap_remove(pos).id)
    }

    /// Remove every entry, returning the pattern strings that were active.
    pub fn clear(&self) -> Vec<String> {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .map(|e| e.matcher.as_str().to_string())
            .collect()
    }

    /// Patterns of all active entries, for post-reconnect replay.
    pub fn patterns(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|e| e.matcher.as_str().to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_empty()
    }

    /// Deliver a message to every matching subscriber.
    ///
    /// Uses `try_send` per destination: a full buffer drops the message
    /// for that subscriber only, a closed receiver marks the entry dead.
    /// Dead entries are pruned afterwards.
    pub fn route(&self, message: &Arc<RealtimeMessage>) {
        let mut dead: Vec<SubscriptionId> = Vec::new();

        {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for entry in entries.iter() {
                if !entry.matcher.matches(&message.channel) {
                    continue;
                }
                match entry.tx.try_send(Arc::clone(message)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            channel = %message.channel,
                            pattern = %entry.matcher,
                            seq = message.seq,
                            "subscriber buffer full, dropping message"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(entry.id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            for id in dead {
                if let Some(pattern) = self.remove(id) {
                    debug!(%pattern, "pruned subscription with dropped receiver");
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn message(channel: &str) -> Arc<RealtimeMessage> {
        Arc::new(RealtimeMessage {
            channel: channel.to_string(),
            action: None,
            payload: serde_json::Value::Null,
            seq: 0,
        })
    }

    fn register(registry: &SubscriptionRegistry, pattern: &str, cap: usize)
    -> (SubscriptionId, mpsc::Receiver<Arc<RealtimeMessage>>) {
        let (tx, rx) = mpsc::channel(cap);
        let id = registry.register(ChannelPattern::compile(pattern).unwrap(), tx);
        (id, rx)
    }

    #[test]
    fn routes_only_to_matching_subscribers() {
        let registry = SubscriptionRegistry::new();
        let (_, mut alarms_rx) = register(&registry, "/alarms/*", 8);
        let (_, mut events_rx) = register(&registry, "/events/*", 8);

        registry.route(&message("/alarms/12345"));

        assert_eq!(alarms_rx.try_recv().unwrap().channel, "/alarms/12345");
        assert!(events_rx.try_recv().is_err());
    }

    #[test]
    fn overlapping_patterns_both_receive() {
        let registry = SubscriptionRegistry::new();
        let (_, mut wild_rx) = register(&registry, "/measurements/*", 8);
        let (_, mut exact_rx) = register(&registry, "/measurements/9920", 8);

        registry.route(&message("/measurements/9920"));

        assert!(wild_rx.try_recv().is_ok());
        assert!(exact_rx.try_recv().is_ok());
    }

    #[test]
    fn full_buffer_drops_without_blocking() {
        let registry = SubscriptionRegistry::new();
        let (_, mut rx) = register(&registry, "/alarms/*", 1);

        registry.route(&message("/alarms/1"));
        registry.route(&message("/alarms/2")); // dropped, buffer of 1 is full

        assert_eq!(rx.try_recv().unwrap().channel, "/alarms/1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_is_pruned() {
        let registry = SubscriptionRegistry::new();
        let (_, rx) = register(&registry, "/alarms/*", 8);
        drop(rx);

        registry.route(&message("/alarms/1"));

        assert!(registry.is_empty());
    }

    #[test]
    fn remove_by_pattern_and_clear() {
        let registry = SubscriptionRegistry::new();
        let (id, _rx1) = register(&registry, "/alarms/*", 8);
        let (_, _rx2) = register(&registry, "/events/*", 8);

        assert_eq!(registry.remove(id).as_deref(), Some("/alarms/*"));
        assert!(registry.remove_by_pattern("/nope").is_none());

        let cleared = registry.clear();
        assert_eq!(cleared, vec!["/events/*".to_string()]);
        assert!(registry.is_empty());
    }

    #[test]
    fn patterns_reports_active_entries() {
        let registry = SubscriptionRegistry::new();
        let (_, _rx) = register(&registry, "/operations/*", 8);

        assert_eq!(registry.patterns(), vec!["/operations/*".to_string()]);
    }
}
