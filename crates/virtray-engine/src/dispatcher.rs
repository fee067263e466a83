use tokio::sync::{mpsc, oneshot};
use virtray_core::{DispatchError, DispatchResult, GuestAction, GuestId};

/// A user-initiated start/stop request travelling into the reconciler task.
/// Precondition checks happen there, against the authoritative snapshot, so
/// validation never races a snapshot swap.
#[derive(Debug)]
pub struct CommandRequest {
    pub guest: GuestId,
    pub action: GuestAction,
    pub reply: oneshot::Sender<DispatchResult>,
}

/// Cheap cloneable handle the presentation side uses to issue commands.
#[derive(Clone)]
pub struct Dispatcher {
    requests: mpsc::Sender<CommandRequest>,
}

impl Dispatcher {
    pub(crate) fn new(requests: mpsc::Sender<CommandRequest>) -> Self {
        Self { requests }
    }

    /// Validates and dispatches one command. The returned record is resolved
    /// immediately for no-op short-circuits and precondition failures;
    /// otherwise it is pending and the final outcome surfaces through the
    /// render stream.
    pub async fn dispatch(&self, guest: GuestId, action: GuestAction) -> DispatchResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(CommandRequest {
                guest,
                action,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DispatchError::ShuttingDown)?;
        reply_rx.await.map_err(|_| DispatchError::ShuttingDown)?
    }
}
