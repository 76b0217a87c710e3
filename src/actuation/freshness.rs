use std::collections::HashMap;

use tracing::debug;

use super::Relay;

/// Drops commands older than the last one let through for the same relay.
///
/// At-least-once delivery may hand us duplicates and reordered commands; only
/// commands at least as new as the last admitted one may take effect.
#[derive(Clone, Debug, Default)]
pub struct FreshnessFilter {
    last_received: HashMap<Relay, f64>,
}

impl FreshnessFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits `sent` and records it, or rejects it without touching any state.
    pub fn admit(&mut self, relay: Relay, sent: f64) -> bool {
        if let Some(last) = self.last_received.get(&relay) {
            if sent < *last {
                debug!(
                    "Discarding stale {} command sent at {} (last received {})",
                    relay, sent, last
                );
                return false;
            }
        }
        self.last_received.insert(relay, sent);
        true
    }

    pub fn last_received(&self, relay: Relay) -> Option<f64> {
        self.last_received.get(&relay).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn older_command_is_discarded() {
        let mut filter = FreshnessFilter::new();
        assert!(filter.admit(Relay::Light, 200.0));
        assert!(!filter.admit(Relay::Light, 100.0));
        assert_eq!(filter.last_received(Relay::Light), Some(200.0));
    }

    #[test]
    fn equal_timestamp_passes() {
        let mut filter = FreshnessFilter::new();
        assert!(filter.admit(Relay::Pump, 50.0));
        assert!(filter.admit(Relay::Pump, 50.0));
    }

    #[test]
    fn kinds_are_tracked_separately() {
        let mut filter = FreshnessFilter::new();
        assert!(filter.admit(Relay::Light, 300.0));
        assert!(filter.admit(Relay::Pump, 10.0));
        assert_eq!(filter.last_received(Relay::Pump), Some(10.0));
        assert_eq!(filter.last_received(Relay::Light), Some(300.0));
    }

    #[test]
    fn first_command_always_passes() {
        let mut filter = FreshnessFilter::new();
        assert_eq!(filter.last_received(Relay::Light), None);
        assert!(filter.admit(Relay::Light, 0.0));
    }
}
