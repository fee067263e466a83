use crate::error::{CommandError, DispatchError};
use crate::guest::GuestId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuestAction {
    Start,
    Stop,
}

impl GuestAction {
    pub fn label(self) -> &'static str {
        match self {
            GuestAction::Start => "start",
            GuestAction::Stop => "stop",
        }
    }

    /// The power state this action drives the guest towards.
    pub fn desired_state(self) -> crate::guest::PowerState {
        match self {
            GuestAction::Start => crate::guest::PowerState::Running,
            GuestAction::Stop => crate::guest::PowerState::Stopped,
        }
    }
}

impl fmt::Display for GuestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Pending,
    Succeeded,
    /// The guest was already in the desired state; no backend call was made.
    NoOp,
    Failed(CommandError),
}

impl CommandOutcome {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, CommandOutcome::Pending)
    }
}

/// A user-initiated command and its lifecycle. Created at dispatch, resolved
/// when the backend call returns, times out, or is short-circuited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub guest: GuestId,
    pub action: GuestAction,
    pub issued_at: DateTime<Utc>,
    pub outcome: CommandOutcome,
}

impl PendingCommand {
    pub fn new(guest: GuestId, action: GuestAction, issued_at: DateTime<Utc>) -> Self {
        Self {
            guest,
            action,
            issued_at,
            outcome: CommandOutcome::Pending,
        }
    }

    pub fn resolved(mut self, outcome: CommandOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

/// What `dispatch` hands back to the caller after precondition checks.
pub type DispatchResult = Result<PendingCommand, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::PowerState;

    #[test]
    fn action_desired_states() {
        assert_eq!(GuestAction::Start.desired_state(), PowerState::Running);
        assert_eq!(GuestAction::Stop.desired_state(), PowerState::Stopped);
    }

    #[test]
    fn pending_command_resolves_once() {
        let issued = Utc::now();
        let command = PendingCommand::new(GuestId::from("vm-a"), GuestAction::Stop, issued);
        assert!(!command.outcome.is_resolved());
        let resolved = command.resolved(CommandOutcome::NoOp);
        assert!(resolved.outcome.is_resolved());
        assert_eq!(resolved.issued_at, issued);
    }
}
