use crate::guest::{GuestId, GuestRecord, PowerState};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// One point-in-time, fully-enumerated view of all guests. Ordered by
/// identity so iteration and diffing are deterministic. Records are
/// value-copied between snapshots, never aliased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub guests: BTreeMap<GuestId, GuestRecord>,
    pub captured_at: DateTime<Utc>,
    pub valid: bool,
}

impl Snapshot {
    pub fn empty(captured_at: DateTime<Utc>) -> Self {
        Self {
            guests: BTreeMap::new(),
            captured_at,
            valid: true,
        }
    }

    pub fn from_records(
        records: impl IntoIterator<Item = GuestRecord>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        let guests = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Self {
            guests,
            captured_at,
            valid: true,
        }
    }

    pub fn get(&self, id: &GuestId) -> Option<&GuestRecord> {
        self.guests.get(id)
    }

    pub fn contains(&self, id: &GuestId) -> bool {
        self.guests.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.guests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guests.is_empty()
    }

    pub fn any_running(&self) -> bool {
        self.guests
            .values()
            .any(|record| record.state == PowerState::Running)
    }

    pub fn records(&self) -> impl Iterator<Item = &GuestRecord> {
        self.guests.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000)
            .single()
            .expect("valid test timestamp")
    }

    #[test]
    fn records_are_ordered_by_identity() {
        let snapshot = Snapshot::from_records(
            [
                GuestRecord::new("vm-b", "beta", PowerState::Stopped, ts()),
                GuestRecord::new("vm-a", "alpha", PowerState::Running, ts()),
            ],
            ts(),
        );
        let ids: Vec<&str> = snapshot.records().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["vm-a", "vm-b"]);
    }

    #[test]
    fn any_running_reflects_guest_states() {
        let stopped = Snapshot::from_records(
            [GuestRecord::new("vm-a", "alpha", PowerState::Stopped, ts())],
            ts(),
        );
        assert!(!stopped.any_running());

        let running = Snapshot::from_records(
            [
                GuestRecord::new("vm-a", "alpha", PowerState::Stopped, ts()),
                GuestRecord::new("vm-b", "beta", PowerState::Running, ts()),
            ],
            ts(),
        );
        assert!(running.any_running());
        assert!(Snapshot::empty(ts()).is_empty());
    }
}
