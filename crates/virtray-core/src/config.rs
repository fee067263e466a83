use std::time::Duration;

/// Engine tuning, supplied as plain values at construction time. The binary
/// owns parsing (flags, environment); the engine only reads these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Fixed reconciliation interval.
    pub poll_interval: Duration,
    /// Bound on a single connection attempt.
    pub connect_timeout: Duration,
    /// Bound on a single guest enumeration.
    pub fetch_timeout: Duration,
    /// Bound on a single start/stop backend call.
    pub command_timeout: Duration,
    /// Reconnect backoff cap, as a multiple of `poll_interval`. Retries never
    /// run tighter than the poll interval.
    pub backoff_cap_multiplier: u32,
    /// Poll cycles an optimistic `Transitioning` override survives without
    /// confirmation before being reverted.
    pub optimistic_max_polls: u32,
    /// Grace period for in-flight backend calls on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(8),
            command_timeout: Duration::from_secs(15),
            backoff_cap_multiplier: 2,
            optimistic_max_polls: 3,
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

impl EngineConfig {
    pub fn backoff_cap(&self) -> Duration {
        self.poll_interval * self.backoff_cap_multiplier.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_interval() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.backoff_cap(), Duration::from_secs(20));
    }

    #[test]
    fn backoff_cap_never_collapses_to_zero() {
        let config = EngineConfig {
            backoff_cap_multiplier: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.backoff_cap(), config.poll_interval);
    }
}
