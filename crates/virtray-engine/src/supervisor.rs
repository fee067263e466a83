use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use virtray_backend::{Hypervisor, SharedConnection};
use virtray_core::EngineConfig;

/// Connection lifecycle as seen by the rest of the engine. Only the
/// supervisor writes this; the reconciler reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded(String),
}

/// Pure reconnect backoff: exponential from the base interval, capped, never
/// tighter than the base. Clock is passed in so the schedule is testable
/// without waiting.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    base: Duration,
    cap: Duration,
    consecutive_failures: u32,
    next_attempt_at: Option<DateTime<Utc>>,
}

impl RetrySchedule {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            consecutive_failures: 0,
            next_attempt_at: None,
        }
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures <= 1 {
            return self.base;
        }
        let shift = (failures - 1).min(16);
        let multiplied = self
            .base
            .checked_mul(1u32 << shift)
            .unwrap_or(Duration::MAX);
        multiplied.min(self.cap)
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.delay_for(self.consecutive_failures);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.next_attempt_at = Some(now + delay);
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.next_attempt_at = None;
    }

    pub fn ready(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| now >= at)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Owns the single live backend connection. Every other component reaches the
/// backend through the handle this hands out; the handle is closed before any
/// reconnect attempt and on shutdown, so it never leaks across attempts.
pub struct ConnectionSupervisor {
    hypervisor: Arc<dyn Hypervisor>,
    connection: Option<SharedConnection>,
    state: ConnectionState,
    schedule: RetrySchedule,
    connect_timeout: Duration,
}

impl ConnectionSupervisor {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, config: &EngineConfig) -> Self {
        Self {
            hypervisor,
            connection: None,
            state: ConnectionState::Disconnected,
            schedule: RetrySchedule::new(config.poll_interval, config.backoff_cap()),
            connect_timeout: config.connect_timeout,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_usable(&self) -> bool {
        self.state == ConnectionState::Connected && self.connection.is_some()
    }

    pub fn connection(&self) -> Option<SharedConnection> {
        self.connection.clone()
    }

    pub async fn ensure_connected(&mut self, now: DateTime<Utc>) -> &ConnectionState {
        if self.is_usable() {
            return &self.state;
        }
        if !self.schedule.ready(now) {
            return &self.state;
        }
        self.release().await;
        self.state = ConnectionState::Connecting;
        match tokio::time::timeout(self.connect_timeout, self.hypervisor.open()).await {
            Ok(Ok(connection)) => {
                self.connection = Some(connection);
                self.state = ConnectionState::Connected;
                self.schedule.record_success();
                info!(event = "backend_connected");
            }
            Ok(Err(err)) => {
                self.schedule.record_failure(now);
                warn!(
                    event = "backend_connect_failed",
                    error = %err,
                    failures = self.schedule.consecutive_failures()
                );
                self.state = ConnectionState::Degraded(err.to_string());
            }
            Err(_) => {
                self.schedule.record_failure(now);
                warn!(
                    event = "backend_connect_timeout",
                    failures = self.schedule.consecutive_failures()
                );
                self.state = ConnectionState::Degraded("connection attempt timed out".to_string());
            }
        }
        &self.state
    }

    /// Called when a fetch or action reveals the connection is gone. Closes
    /// the handle and arms the backoff so the next tick reconnects.
    pub async fn mark_failed(&mut self, reason: String, now: DateTime<Utc>) {
        self.release().await;
        self.schedule.record_failure(now);
        warn!(event = "backend_degraded", reason = %reason);
        self.state = ConnectionState::Degraded(reason);
    }

    pub async fn shutdown(&mut self) {
        self.release().await;
        self.state = ConnectionState::Disconnected;
    }

    async fn release(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use virtray_backend::{FakeHypervisor, HypervisorConnection};

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms)
            .single()
            .expect("valid test timestamp")
    }

    fn config() -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_secs(10),
            backoff_cap_multiplier: 2,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn delays_are_non_decreasing_and_capped() {
        let schedule = RetrySchedule::new(Duration::from_secs(10), Duration::from_secs(20));
        let delays: Vec<Duration> = (1..=6).map(|n| schedule.delay_for(n)).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0], "delays must not shrink: {delays:?}");
        }
        assert_eq!(delays[0], Duration::from_secs(10));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(20)));
    }

    #[test]
    fn never_retries_tighter_than_base_interval() {
        let mut schedule = RetrySchedule::new(Duration::from_secs(10), Duration::from_secs(20));
        schedule.record_failure(ts(0));
        assert!(!schedule.ready(ts(9_999)));
        assert!(schedule.ready(ts(10_000)));
    }

    #[test]
    fn success_resets_the_schedule() {
        let mut schedule = RetrySchedule::new(Duration::from_secs(10), Duration::from_secs(20));
        schedule.record_failure(ts(0));
        schedule.record_failure(ts(10_000));
        assert_eq!(schedule.consecutive_failures(), 2);
        schedule.record_success();
        assert_eq!(schedule.consecutive_failures(), 0);
        assert!(schedule.ready(ts(10_001)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn supervisor_backs_off_and_recovers() {
        let fake = FakeHypervisor::seeded();
        fake.fail_opens(3);
        let mut supervisor = ConnectionSupervisor::new(Arc::new(fake.clone()), &config());

        assert!(matches!(
            supervisor.ensure_connected(ts(0)).await,
            ConnectionState::Degraded(_)
        ));
        // Still backing off: no second attempt before the base interval.
        supervisor.ensure_connected(ts(5_000)).await;
        assert_eq!(fake.counts().opens, 1);

        supervisor.ensure_connected(ts(10_000)).await;
        assert_eq!(fake.counts().opens, 2);

        // Two failures: next attempt waits the doubled (capped) delay.
        supervisor.ensure_connected(ts(20_000)).await;
        assert_eq!(fake.counts().opens, 2);
        supervisor.ensure_connected(ts(30_000)).await;
        assert_eq!(fake.counts().opens, 3);

        supervisor.ensure_connected(ts(50_000)).await;
        assert!(supervisor.is_usable());
        assert_eq!(fake.counts().opens, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mark_failed_releases_the_handle() {
        let fake = FakeHypervisor::seeded();
        let mut supervisor = ConnectionSupervisor::new(Arc::new(fake.clone()), &config());
        supervisor.ensure_connected(ts(0)).await;
        let handle = supervisor.connection().expect("connected");

        supervisor.mark_failed("enumeration severed".to_string(), ts(0)).await;
        assert!(!supervisor.is_usable());
        assert!(supervisor.connection().is_none());
        // The released handle was closed, not leaked.
        assert!(handle.list_guests().await.is_err());
    }
}
