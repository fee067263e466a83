use crate::guest::{GuestId, GuestRecord, PowerState};
use crate::snapshot::Snapshot;

/// A single observed difference between two snapshots. Produced and consumed
/// within one reconciliation cycle, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Added(GuestRecord),
    Removed(GuestId),
    StateChanged(GuestId, PowerState, PowerState),
}

impl ChangeEvent {
    pub fn guest_id(&self) -> &GuestId {
        match self {
            ChangeEvent::Added(record) => &record.id,
            ChangeEvent::Removed(id) => id,
            ChangeEvent::StateChanged(id, _, _) => id,
        }
    }
}

/// Compares two snapshots and returns the changes ordered by identity.
///
/// Total over any pair of snapshots, including empty ones. A missing
/// `previous` is the bootstrap case: every current entry is `Added`.
pub fn diff(previous: Option<&Snapshot>, current: &Snapshot) -> Vec<ChangeEvent> {
    let Some(previous) = previous else {
        return current
            .records()
            .map(|record| ChangeEvent::Added(record.clone()))
            .collect();
    };

    let mut events = Vec::new();
    let mut old_iter = previous.guests.iter().peekable();
    let mut new_iter = current.guests.iter().peekable();

    loop {
        match (old_iter.peek(), new_iter.peek()) {
            (Some((old_id, old_record)), Some((new_id, new_record))) => {
                if old_id < new_id {
                    events.push(ChangeEvent::Removed((*old_id).clone()));
                    old_iter.next();
                } else if old_id > new_id {
                    events.push(ChangeEvent::Added((*new_record).clone()));
                    new_iter.next();
                } else {
                    if old_record.state != new_record.state {
                        events.push(ChangeEvent::StateChanged(
                            (*new_id).clone(),
                            old_record.state,
                            new_record.state,
                        ));
                    }
                    old_iter.next();
                    new_iter.next();
                }
            }
            (Some((old_id, _)), None) => {
                events.push(ChangeEvent::Removed((*old_id).clone()));
                old_iter.next();
            }
            (None, Some((_, new_record))) => {
                events.push(ChangeEvent::Added((*new_record).clone()));
                new_iter.next();
            }
            (None, None) => break,
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000)
            .single()
            .expect("valid test timestamp")
    }

    fn snap(entries: &[(&str, PowerState)]) -> Snapshot {
        Snapshot::from_records(
            entries
                .iter()
                .map(|(id, state)| GuestRecord::new(*id, *id, *state, ts())),
            ts(),
        )
    }

    fn apply(previous: &Snapshot, events: &[ChangeEvent]) -> Snapshot {
        let mut guests = previous.guests.clone();
        for event in events {
            match event {
                ChangeEvent::Added(record) => {
                    guests.insert(record.id.clone(), record.clone());
                }
                ChangeEvent::Removed(id) => {
                    guests.remove(id);
                }
                ChangeEvent::StateChanged(id, _, new_state) => {
                    let record = guests.get_mut(id).expect("state change for known guest");
                    record.state = *new_state;
                }
            }
        }
        Snapshot {
            guests,
            captured_at: ts(),
            valid: true,
        }
    }

    #[test]
    fn bootstrap_diff_adds_every_guest() {
        let current = snap(&[
            ("vm-a", PowerState::Running),
            ("vm-b", PowerState::Stopped),
        ]);
        let events = diff(None, &current);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ChangeEvent::Added(r) if r.id.as_str() == "vm-a"));
        assert!(matches!(&events[1], ChangeEvent::Added(r) if r.id.as_str() == "vm-b"));
    }

    #[test]
    fn self_diff_is_empty() {
        let current = snap(&[
            ("vm-a", PowerState::Running),
            ("vm-b", PowerState::Unknown),
        ]);
        assert!(diff(Some(&current), &current).is_empty());
        let empty = snap(&[]);
        assert!(diff(Some(&empty), &empty).is_empty());
    }

    #[test]
    fn mixed_diff_is_ordered_by_identity() {
        let previous = snap(&[
            ("vm-a", PowerState::Running),
            ("vm-b", PowerState::Stopped),
            ("vm-d", PowerState::Running),
        ]);
        let current = snap(&[
            ("vm-b", PowerState::Running),
            ("vm-c", PowerState::Stopped),
            ("vm-d", PowerState::Running),
        ]);
        let events = diff(Some(&previous), &current);
        assert_eq!(
            events,
            vec![
                ChangeEvent::Removed(GuestId::from("vm-a")),
                ChangeEvent::StateChanged(
                    GuestId::from("vm-b"),
                    PowerState::Stopped,
                    PowerState::Running
                ),
                ChangeEvent::Added(GuestRecord::new(
                    "vm-c",
                    "vm-c",
                    PowerState::Stopped,
                    ts()
                )),
            ]
        );
    }

    #[test]
    fn events_reconstruct_current_from_previous() {
        let previous = snap(&[
            ("vm-a", PowerState::Running),
            ("vm-b", PowerState::Stopped),
            ("vm-c", PowerState::Unknown),
        ]);
        let current = snap(&[
            ("vm-b", PowerState::Running),
            ("vm-c", PowerState::Unknown),
            ("vm-e", PowerState::Stopped),
        ]);
        let events = diff(Some(&previous), &current);
        let rebuilt = apply(&previous, &events);
        assert_eq!(rebuilt.guests, current.guests);
    }

    #[test]
    fn diff_is_pure_and_repeatable() {
        let previous = snap(&[("vm-a", PowerState::Running)]);
        let current = snap(&[("vm-a", PowerState::Stopped), ("vm-b", PowerState::Running)]);
        let first = diff(Some(&previous), &current);
        let second = diff(Some(&previous), &current);
        assert_eq!(first, second);
    }

    #[test]
    fn removed_events_reference_only_vanished_guests() {
        let previous = snap(&[("vm-a", PowerState::Running), ("vm-b", PowerState::Stopped)]);
        let current = snap(&[("vm-b", PowerState::Stopped)]);
        let events = diff(Some(&previous), &current);
        for event in &events {
            match event {
                ChangeEvent::Removed(id) => {
                    assert!(previous.contains(id));
                    assert!(!current.contains(id));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
}
