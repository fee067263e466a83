use crate::{GuestListing, Hypervisor, HypervisorConnection, SharedConnection};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use virtray_core::{BackendError, GuestId};

#[derive(Debug, Clone)]
struct FakeGuest {
    name: String,
    raw_status: String,
}

#[derive(Debug, Default)]
struct FakeState {
    guests: BTreeMap<GuestId, FakeGuest>,
    open_failures_remaining: u32,
    fail_next_list: Option<String>,
    list_delay: Option<Duration>,
    action_delay: Option<Duration>,
    opens: u64,
    lists: u64,
    starts: u64,
    stops: u64,
}

/// Call counts observed by the fake, for asserting zero-backend-call
/// properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub opens: u64,
    pub lists: u64,
    pub starts: u64,
    pub stops: u64,
}

/// Deterministic in-memory backend. Scripted failures and delays make the
/// engine's degraded paths reproducible in tests; actions take effect
/// immediately so the next enumeration observes them.
#[derive(Clone, Default)]
pub struct FakeHypervisor {
    state: Arc<Mutex<FakeState>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The fixture set used in test mode: one running and one stopped guest.
    pub fn seeded() -> Self {
        let fake = Self::new();
        fake.add_guest("vm-alpha", "alpha", "running");
        fake.add_guest("vm-beta", "beta", "shut off");
        fake
    }

    pub fn add_guest(&self, id: impl Into<GuestId>, name: &str, raw_status: &str) {
        let mut state = self.state.lock().expect("fake state poisoned");
        state.guests.insert(
            id.into(),
            FakeGuest {
                name: name.to_string(),
                raw_status: raw_status.to_string(),
            },
        );
    }

    pub fn remove_guest(&self, id: &GuestId) {
        let mut state = self.state.lock().expect("fake state poisoned");
        state.guests.remove(id);
    }

    pub fn set_guest_status(&self, id: &GuestId, raw_status: &str) {
        let mut state = self.state.lock().expect("fake state poisoned");
        if let Some(guest) = state.guests.get_mut(id) {
            guest.raw_status = raw_status.to_string();
        }
    }

    /// The next `count` open attempts fail before one succeeds.
    pub fn fail_opens(&self, count: u32) {
        let mut state = self.state.lock().expect("fake state poisoned");
        state.open_failures_remaining = count;
    }

    pub fn fail_next_list(&self, reason: &str) {
        let mut state = self.state.lock().expect("fake state poisoned");
        state.fail_next_list = Some(reason.to_string());
    }

    pub fn set_list_delay(&self, delay: Option<Duration>) {
        let mut state = self.state.lock().expect("fake state poisoned");
        state.list_delay = delay;
    }

    pub fn set_action_delay(&self, delay: Option<Duration>) {
        let mut state = self.state.lock().expect("fake state poisoned");
        state.action_delay = delay;
    }

    pub fn counts(&self) -> CallCounts {
        let state = self.state.lock().expect("fake state poisoned");
        CallCounts {
            opens: state.opens,
            lists: state.lists,
            starts: state.starts,
            stops: state.stops,
        }
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn open(&self) -> Result<SharedConnection, BackendError> {
        let mut state = self.state.lock().expect("fake state poisoned");
        state.opens += 1;
        if state.open_failures_remaining > 0 {
            state.open_failures_remaining -= 1;
            return Err(BackendError::Open("scripted open failure".to_string()));
        }
        drop(state);
        Ok(Arc::new(FakeConnection {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeConnection {
    state: Arc<Mutex<FakeState>>,
    closed: AtomicBool,
}

impl FakeConnection {
    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl HypervisorConnection for FakeConnection {
    async fn list_guests(&self) -> Result<Vec<GuestListing>, BackendError> {
        self.ensure_open()?;
        let delay = {
            let mut state = self.state.lock().expect("fake state poisoned");
            state.lists += 1;
            state.list_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().expect("fake state poisoned");
        if let Some(reason) = state.fail_next_list.take() {
            return Err(BackendError::List(reason));
        }
        Ok(state
            .guests
            .iter()
            .map(|(id, guest)| GuestListing {
                id: id.clone(),
                name: guest.name.clone(),
                raw_status: guest.raw_status.clone(),
            })
            .collect())
    }

    async fn start(&self, id: &GuestId) -> Result<(), BackendError> {
        self.ensure_open()?;
        let delay = {
            let mut state = self.state.lock().expect("fake state poisoned");
            state.starts += 1;
            state.action_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().expect("fake state poisoned");
        match state.guests.get_mut(id) {
            Some(guest) => {
                guest.raw_status = "running".to_string();
                Ok(())
            }
            None => Err(BackendError::UnknownGuest(id.clone())),
        }
    }

    async fn stop(&self, id: &GuestId) -> Result<(), BackendError> {
        self.ensure_open()?;
        let delay = {
            let mut state = self.state.lock().expect("fake state poisoned");
            state.stops += 1;
            state.action_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().expect("fake state poisoned");
        match state.guests.get_mut(id) {
            Some(guest) => {
                guest.raw_status = "shut off".to_string();
                Ok(())
            }
            None => Err(BackendError::UnknownGuest(id.clone())),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scripted_open_failures_then_success() {
        let fake = FakeHypervisor::seeded();
        fake.fail_opens(2);

        assert!(fake.open().await.is_err());
        assert!(fake.open().await.is_err());
        let conn = fake.open().await.expect("third open succeeds");
        assert_eq!(fake.counts().opens, 3);

        let listings = conn.list_guests().await.expect("list");
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].id, GuestId::from("vm-alpha"));
        assert_eq!(listings[0].raw_status, "running");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn actions_mutate_status_and_count_calls() {
        let fake = FakeHypervisor::seeded();
        let conn = fake.open().await.expect("open");

        conn.stop(&GuestId::from("vm-alpha")).await.expect("stop");
        let listings = conn.list_guests().await.expect("list");
        assert_eq!(listings[0].raw_status, "shut off");

        conn.start(&GuestId::from("vm-beta")).await.expect("start");
        let counts = fake.counts();
        assert_eq!(counts.starts, 1);
        assert_eq!(counts.stops, 1);

        let missing = conn.start(&GuestId::from("vm-ghost")).await;
        assert_eq!(
            missing,
            Err(BackendError::UnknownGuest(GuestId::from("vm-ghost")))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_connection_rejects_calls() {
        let fake = FakeHypervisor::seeded();
        let conn = fake.open().await.expect("open");
        conn.close().await;
        assert_eq!(conn.list_guests().await, Err(BackendError::Closed));
        assert_eq!(
            conn.stop(&GuestId::from("vm-alpha")).await,
            Err(BackendError::Closed)
        );
    }
}
