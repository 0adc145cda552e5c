// ── Reconnect backoff policy ──
//
// Shared by the Bayeux client and the notification2 consumer so every
// reconnect path applies the same bounded exponential delay.

use std::time::Duration;

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            max_retries: None,
        }
    }
}

impl ReconnectConfig {
    /// Defaults for the notification2 consumer stream (5s floor).
    pub fn consumer() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            max_retries: None,
        }
    }

    /// Delay before attempt `attempt + 1`:
    /// `min(initial_delay * 2^attempt, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let doubled = self
            .initial_delay
            .checked_mul(2_u32.saturating_pow(attempt.min(31)))
            .unwrap_or(self.max_delay);
        doubled.min(self.max_delay)
    }

    /// Returns `true` if another attempt is allowed after `attempt` failures.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_retries.is_none_or(|max| attempt < max)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(300));
        assert!(config.max_retries.is_none());
    }

    #[test]
    fn consumer_defaults_start_at_five_seconds() {
        let config = ReconnectConfig::consumer();
        assert_eq!(config.initial_delay, Duration::from_secs(5));
        assert_eq!(config.max_delay, Duration::from_secs(300));
    }

    #[test]
    fn backoff_doubles_each_attempt() {
        let config = ReconnectConfig::default();

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(32));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            max_retries: None,
        };

        // 5 * 2^6 = 320 > 300
        assert_eq!(config.delay_for_attempt(6), Duration::from_secs(300));
        // Far past the cap, including shift-overflow territory
        assert_eq!(config.delay_for_attempt(40), Duration::from_secs(300));
    }

    #[test]
    fn retry_limit_is_honored() {
        let config = ReconnectConfig {
            max_retries: Some(3),
            ..ReconnectConfig::default()
        };

        assert!(config.allows_attempt(0));
        assert!(config.allows_attempt(2));
        assert!(!config.allows_attempt(3));
    }

    #[test]
    fn unlimited_retries_by_default() {
        let config = ReconnectConfig::default();
        assert!(config.allows_attempt(u32::MAX));
    }
}
