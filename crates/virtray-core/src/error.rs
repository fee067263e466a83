use crate::command::GuestAction;
use crate::guest::GuestId;
use thiserror::Error;

/// Failure at the virtualization capability boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("failed to open connection: {0}")]
    Open(String),
    #[error("enumeration failed: {0}")]
    List(String),
    #[error("action failed for {guest}: {reason}")]
    Action { guest: GuestId, reason: String },
    #[error("guest not found on backend: {0}")]
    UnknownGuest(GuestId),
    #[error("connection closed")]
    Closed,
}

/// A whole poll failed; the connection must be treated as unusable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("fetch timed out")]
    TimedOut,
    #[error(transparent)]
    Backend(BackendError),
}

/// A start/stop command failed. Surfaced to the user once, never retried
/// automatically.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("{action} {guest} timed out")]
    TimedOut { guest: GuestId, action: GuestAction },
    #[error("{action} {guest} failed: {reason}")]
    Backend {
        guest: GuestId,
        action: GuestAction,
        reason: String,
    },
}

/// Dispatch precondition violation; fails fast before any backend call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown guest: {0}")]
    UnknownGuest(GuestId),
    #[error("command already in flight for {0}")]
    CommandInFlight(GuestId),
    #[error("engine is shutting down")]
    ShuttingDown,
}
