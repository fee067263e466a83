pub mod dispatcher;
pub mod fetcher;
pub mod reconciler;
pub mod supervisor;

pub use dispatcher::Dispatcher;
pub use reconciler::Reconciler;
pub use supervisor::{ConnectionState, ConnectionSupervisor, RetrySchedule};

use std::sync::Arc;
use tokio::sync::mpsc;
use virtray_backend::Hypervisor;
use virtray_core::{EngineConfig, RenderInstruction};

const RENDER_QUEUE_CAPACITY: usize = 64;

/// Wires the engine together: the reconciler task (run it with a shutdown
/// watch), the dispatcher handle for user commands, and the render
/// instruction stream for the presentation adapter.
pub fn build_engine(
    config: EngineConfig,
    hypervisor: Arc<dyn Hypervisor>,
) -> (Reconciler, Dispatcher, mpsc::Receiver<RenderInstruction>) {
    let (render_tx, render_rx) = mpsc::channel(RENDER_QUEUE_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel(reconciler::COMMAND_QUEUE_CAPACITY);
    let supervisor = ConnectionSupervisor::new(hypervisor, &config);
    let reconciler = Reconciler::new(config, supervisor, render_tx, command_rx);
    (reconciler, Dispatcher::new(command_tx), render_rx)
}
