use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque stable identity of a guest as reported by the backend (UUID or
/// unique name). Ordered so snapshots and diffs are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuestId(pub String);

impl GuestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GuestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GuestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for GuestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerState {
    Running,
    Stopped,
    Transitioning,
    Unknown,
}

impl PowerState {
    /// Total mapping from backend status strings. Anything outside the known
    /// vocabulary becomes `Unknown`; raw strings never reach the
    /// authoritative state.
    pub fn from_raw_status(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" | "active" => PowerState::Running,
            "stopped" | "shutoff" | "shut off" | "inactive" => PowerState::Stopped,
            "transitioning" | "starting" | "stopping" | "shutdown" | "pmsuspended" => {
                PowerState::Transitioning
            }
            _ => PowerState::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PowerState::Running => "running",
            PowerState::Stopped => "stopped",
            PowerState::Transitioning => "transitioning",
            PowerState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestRecord {
    pub id: GuestId,
    pub display_name: String,
    pub state: PowerState,
    pub observed_at: DateTime<Utc>,
}

impl GuestRecord {
    pub fn new(
        id: impl Into<GuestId>,
        display_name: impl Into<String>,
        state: PowerState,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            state,
            observed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_status_maps_to_closed_enum() {
        assert_eq!(PowerState::from_raw_status("running"), PowerState::Running);
        assert_eq!(PowerState::from_raw_status("RUNNING"), PowerState::Running);
        assert_eq!(PowerState::from_raw_status("shut off"), PowerState::Stopped);
        assert_eq!(PowerState::from_raw_status("shutoff"), PowerState::Stopped);
        assert_eq!(
            PowerState::from_raw_status("starting"),
            PowerState::Transitioning
        );
        assert_eq!(
            PowerState::from_raw_status("some-vendor-state"),
            PowerState::Unknown
        );
        assert_eq!(PowerState::from_raw_status(""), PowerState::Unknown);
    }
}
