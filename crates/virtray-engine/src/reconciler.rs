use crate::dispatcher::CommandRequest;
use crate::fetcher;
use crate::supervisor::ConnectionSupervisor;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use virtray_backend::HypervisorConnection;
use virtray_core::{
    diff, ChangeEvent, CommandError, CommandOutcome, DispatchError, EngineConfig, FetchError,
    GuestAction, GuestId, MenuItem, PendingCommand, PowerState, RenderInstruction, Snapshot,
};

/// Provisional `Transitioning` shown for a guest after an accepted command,
/// until a poll confirms the real state or the override expires. Poll truth
/// always wins.
#[derive(Debug, Clone)]
struct OptimisticOverride {
    /// Observed state when the command was accepted; any polled state other
    /// than this means the backend has moved and the override is done.
    baseline: PowerState,
    unconfirmed_polls: u32,
}

/// The authoritative in-memory state. All mutation happens on the reconciler
/// task; snapshots are swapped whole, never field-patched.
#[derive(Debug, Default)]
pub(crate) struct EngineState {
    snapshot: Option<Snapshot>,
    stale: bool,
    overrides: BTreeMap<GuestId, OptimisticOverride>,
}

impl EngineState {
    pub(crate) fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    fn has_running(&self) -> bool {
        self.snapshot
            .as_ref()
            .map(Snapshot::any_running)
            .unwrap_or(false)
    }

    fn displayed_state(&self, id: &GuestId, observed: PowerState) -> PowerState {
        if self.overrides.contains_key(id) {
            PowerState::Transitioning
        } else {
            observed
        }
    }

    fn indicator(&self) -> RenderInstruction {
        RenderInstruction::SetIndicator {
            has_running_guest: self.has_running(),
            stale: self.stale,
        }
    }

    fn menu(&self) -> RenderInstruction {
        let items = self
            .snapshot
            .as_ref()
            .map(|snapshot| {
                snapshot
                    .records()
                    .map(|record| {
                        let state = self.displayed_state(&record.id, record.state);
                        MenuItem {
                            id: record.id.clone(),
                            display_name: record.display_name.clone(),
                            state,
                            available_actions: MenuItem::actions_for(state),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        RenderInstruction::SetMenu { items }
    }

    /// Folds one poll outcome into the authoritative state and returns the
    /// change events plus the render instructions to emit. On failure the
    /// stored snapshot is untouched and only the indicator degrades.
    pub(crate) fn apply_fetch_outcome(
        &mut self,
        outcome: Result<Snapshot, FetchError>,
        config: &EngineConfig,
    ) -> (Vec<ChangeEvent>, Vec<RenderInstruction>) {
        match outcome {
            Ok(current) => {
                let events = diff(self.snapshot.as_ref(), &current);
                self.retire_overrides(&current, config);
                self.stale = false;
                self.snapshot = Some(current);
                (events, vec![self.indicator(), self.menu()])
            }
            Err(_) => {
                self.stale = true;
                (Vec::new(), vec![self.indicator()])
            }
        }
    }

    /// Applies the poll-wins rule to optimistic overrides: an override is
    /// dropped once the observed state leaves its baseline (confirmation or
    /// any other movement), once its guest vanishes, or once it has gone
    /// unconfirmed for the configured number of polls.
    fn retire_overrides(&mut self, current: &Snapshot, config: &EngineConfig) {
        self.overrides.retain(|id, entry| match current.get(id) {
            None => {
                debug!(event = "override_dropped", guest = %id, reason = "guest vanished");
                false
            }
            Some(record) if record.state != entry.baseline => {
                debug!(event = "override_confirmed", guest = %id, state = %record.state);
                false
            }
            Some(_) => {
                entry.unconfirmed_polls += 1;
                if entry.unconfirmed_polls >= config.optimistic_max_polls {
                    warn!(
                        event = "override_expired",
                        guest = %id,
                        polls = entry.unconfirmed_polls
                    );
                    false
                } else {
                    true
                }
            }
        });
    }

    fn apply_override(&mut self, guest: GuestId, baseline: PowerState) {
        self.overrides.insert(
            guest,
            OptimisticOverride {
                baseline,
                unconfirmed_polls: 0,
            },
        );
    }
}

/// Result of a spawned backend action call, folded back into the loop.
#[derive(Debug)]
pub(crate) struct CommandCompletion {
    guest: GuestId,
    action: GuestAction,
    baseline: PowerState,
    result: Result<(), CommandError>,
}

pub(crate) const COMMAND_QUEUE_CAPACITY: usize = 16;

/// The scheduler: one task owning the authoritative state, cycling
/// Idle → Polling → Applying on a fixed-interval timer, folding in command
/// requests and completions between ticks.
pub struct Reconciler {
    config: EngineConfig,
    supervisor: ConnectionSupervisor,
    state: EngineState,
    render_tx: mpsc::Sender<RenderInstruction>,
    command_rx: mpsc::Receiver<CommandRequest>,
    completion_tx: mpsc::Sender<CommandCompletion>,
    completion_rx: mpsc::Receiver<CommandCompletion>,
    inflight: BTreeMap<GuestId, PendingCommand>,
}

impl Reconciler {
    pub(crate) fn new(
        config: EngineConfig,
        supervisor: ConnectionSupervisor,
        render_tx: mpsc::Sender<RenderInstruction>,
        command_rx: mpsc::Receiver<CommandRequest>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        Self {
            config,
            supervisor,
            state: EngineState::default(),
            render_tx,
            command_rx,
            completion_tx,
            completion_rx,
            inflight: BTreeMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            event = "engine_started",
            poll_interval_ms = self.config.poll_interval.as_millis() as u64
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once(Utc::now()).await;
                }
                Some(request) = self.command_rx.recv() => {
                    self.handle_command(request, Utc::now()).await;
                }
                Some(completion) = self.completion_rx.recv() => {
                    self.handle_completion(completion).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.supervisor.shutdown().await;
        info!(event = "engine_stopped");
    }

    async fn poll_once(&mut self, now: DateTime<Utc>) {
        debug!(event = "tick", phase = "polling");
        if !self.supervisor.is_usable() {
            self.supervisor.ensure_connected(now).await;
            if !self.supervisor.is_usable() {
                // Degraded tick: keep last-known-good data, flag it stale.
                let (_, render) = self.state.apply_fetch_outcome(
                    Err(FetchError::Backend(virtray_core::BackendError::Closed)),
                    &self.config,
                );
                self.emit(render).await;
                return;
            }
        }
        let Some(connection) = self.supervisor.connection() else {
            return;
        };

        let outcome = fetcher::fetch(&connection, &self.config, now).await;
        debug!(event = "tick", phase = "applying");
        match outcome {
            Ok(snapshot) => {
                let (events, render) = self.state.apply_fetch_outcome(Ok(snapshot), &self.config);
                self.log_events(&events);
                self.emit(render).await;
            }
            Err(err) => {
                self.supervisor.mark_failed(err.to_string(), now).await;
                let (_, render) = self.state.apply_fetch_outcome(Err(err), &self.config);
                self.emit(render).await;
            }
        }
        debug!(event = "tick", phase = "idle");
    }

    async fn handle_command(&mut self, request: CommandRequest, now: DateTime<Utc>) {
        let CommandRequest {
            guest,
            action,
            reply,
        } = request;

        let record = match self.state.snapshot().and_then(|s| s.get(&guest)) {
            Some(record) => record.clone(),
            None => {
                warn!(event = "dispatch_rejected", guest = %guest, reason = "unknown guest");
                let _ = reply.send(Err(DispatchError::UnknownGuest(guest)));
                return;
            }
        };
        if self.inflight.contains_key(&guest) {
            warn!(event = "dispatch_rejected", guest = %guest, reason = "command in flight");
            let _ = reply.send(Err(DispatchError::CommandInFlight(guest)));
            return;
        }

        let pending = PendingCommand::new(guest.clone(), action, now);

        // Already in the desired end state: succeed without a backend call.
        if record.state == action.desired_state() {
            info!(event = "dispatch_noop", guest = %guest, action = %action);
            let _ = reply.send(Ok(pending.resolved(CommandOutcome::NoOp)));
            return;
        }

        let Some(connection) = self.supervisor.connection() else {
            let error = CommandError::Backend {
                guest: guest.clone(),
                action,
                reason: "backend connection unavailable".to_string(),
            };
            warn!(event = "dispatch_failed", guest = %guest, action = %action, error = %error);
            self.emit(vec![RenderInstruction::ShowError {
                message: error.to_string(),
            }])
            .await;
            let _ = reply.send(Ok(pending.resolved(CommandOutcome::Failed(error))));
            return;
        };

        info!(event = "dispatch_accepted", guest = %guest, action = %action);
        self.inflight.insert(guest.clone(), pending.clone());
        let _ = reply.send(Ok(pending));

        let completion_tx = self.completion_tx.clone();
        let timeout = self.config.command_timeout;
        let baseline = record.state;
        tokio::spawn(async move {
            let call = async {
                match action {
                    GuestAction::Start => connection.start(&guest).await,
                    GuestAction::Stop => connection.stop(&guest).await,
                }
            };
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(CommandError::Backend {
                    guest: guest.clone(),
                    action,
                    reason: err.to_string(),
                }),
                Err(_) => Err(CommandError::TimedOut {
                    guest: guest.clone(),
                    action,
                }),
            };
            let _ = completion_tx
                .send(CommandCompletion {
                    guest,
                    action,
                    baseline,
                    result,
                })
                .await;
        });
    }

    async fn handle_completion(&mut self, completion: CommandCompletion) {
        self.inflight.remove(&completion.guest);
        match completion.result {
            Ok(()) => {
                info!(
                    event = "command_succeeded",
                    guest = %completion.guest,
                    action = %completion.action
                );
                self.state
                    .apply_override(completion.guest, completion.baseline);
                // Show the transitioning state right away; the next poll
                // settles it.
                let menu = self.state.menu();
                self.emit(vec![menu]).await;
            }
            Err(error) => {
                // Surfaced exactly once; no automatic retry.
                warn!(
                    event = "command_failed",
                    guest = %completion.guest,
                    action = %completion.action,
                    error = %error
                );
                self.emit(vec![RenderInstruction::ShowError {
                    message: error.to_string(),
                }])
                .await;
            }
        }
    }

    fn log_events(&self, events: &[ChangeEvent]) {
        for event in events {
            match event {
                ChangeEvent::Added(record) => {
                    info!(event = "guest_added", guest = %record.id, state = %record.state);
                }
                ChangeEvent::Removed(id) => {
                    info!(event = "guest_removed", guest = %id);
                }
                ChangeEvent::StateChanged(id, old, new) => {
                    info!(event = "guest_state_changed", guest = %id, from = %old, to = %new);
                }
            }
        }
    }

    async fn emit(&self, instructions: Vec<RenderInstruction>) {
        for instruction in instructions {
            if self.render_tx.send(instruction).await.is_err() {
                debug!(event = "render_receiver_gone");
                return;
            }
        }
    }
}
