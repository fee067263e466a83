pub mod command;
pub mod config;
pub mod diff;
pub mod error;
pub mod guest;
pub mod render;
pub mod snapshot;

pub use command::{CommandOutcome, DispatchResult, GuestAction, PendingCommand};
pub use config::EngineConfig;
pub use error::{BackendError, CommandError, DispatchError, FetchError};
pub use diff::{diff, ChangeEvent};
pub use guest::{GuestId, GuestRecord, PowerState};
pub use render::{MenuItem, RenderInstruction};
pub use snapshot::Snapshot;
