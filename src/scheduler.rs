//! The per-tab task scheduler and its state gate.
//!
//! One scheduler task per tab, processing one request at a time. Requests
//! are admitted against the tab's current lifecycle mode: illegal requests
//! are rejected immediately or parked until the gate opens (per their
//! `wait_for_mode` flag), single-outstanding duplicates are coalesced, and
//! accepted operations execute strictly in acceptance order. While an
//! operation is suspended on a worker call the scheduler also listens on
//! its control channel, so a forced restart can interrupt a hung worker;
//! nothing else preempts an operation.
//!
//! State mutation is exclusive to this task: the gate's `watch` sender has
//! no other writers, and the backlog lives inside the loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueuePolicy;
use crate::core::{Mode, TabState, WorkValue};
use crate::error::{StationError, StationResult};
use crate::operation::{OpArgs, OpContext, Operation, OperationRegistry};
use crate::restart::RestartManager;

// =============================================================================
// State Gate
// =============================================================================

/// Holder of a tab's lifecycle state.
///
/// Wraps the `watch` sender publishing [`TabState`]. The scheduler task is
/// the sole mutator; health queries and the liveness monitor read through
/// receivers. Every mutation resets `since` and emits a mode-change event
/// where applicable.
#[derive(Clone)]
pub struct StateGate {
    tx: Arc<watch::Sender<TabState>>,
    events: broadcast::Sender<TabEvent>,
}

impl StateGate {
    pub(crate) fn new(events: broadcast::Sender<TabEvent>) -> (Self, watch::Receiver<TabState>) {
        let (tx, rx) = watch::channel(TabState::default());
        (
            Self {
                tx: Arc::new(tx),
                events,
            },
            rx,
        )
    }

    /// Current lifecycle mode.
    pub fn mode(&self) -> Mode {
        self.tx.borrow().mode
    }

    /// Whether `op` is legal to start right now.
    pub fn can_run(&self, op: &Operation) -> bool {
        op.allowed_modes().contains(self.mode())
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<TabState> {
        self.tx.subscribe()
    }

    pub(crate) fn set_mode(&self, mode: Mode) {
        self.tx.send_modify(|state| {
            state.mode = mode;
            state.since = Instant::now();
        });
        let _ = self.events.send(TabEvent::ModeChanged { mode });
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.tx.send_modify(|state| {
            state.busy = busy;
            state.since = Instant::now();
        });
    }
}

// =============================================================================
// Requests, Control and Events
// =============================================================================

/// A queued operation request.
#[derive(Debug)]
pub struct OpRequest {
    /// Request identifier, for log correlation.
    pub id: Uuid,
    /// Registered operation name.
    pub operation: String,
    /// Operation arguments.
    pub args: OpArgs,
    /// When true, an illegal request parks until the gate opens instead of
    /// failing immediately.
    pub wait_for_mode: bool,
    /// Finalization slot: receives the final result (or failure) of the
    /// operation. `None` for fire-and-forget requests.
    pub reply: Option<oneshot::Sender<StationResult<WorkValue>>>,
}

impl OpRequest {
    /// Build a request with a finalization receiver.
    pub fn with_reply(
        operation: impl Into<String>,
        args: OpArgs,
    ) -> (Self, oneshot::Receiver<StationResult<WorkValue>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                id: Uuid::new_v4(),
                operation: operation.into(),
                args,
                wait_for_mode: false,
                reply: Some(tx),
            },
            rx,
        )
    }

    /// Build a request nobody waits on.
    pub fn fire_and_forget(operation: impl Into<String>, args: OpArgs) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            args,
            wait_for_mode: false,
            reply: None,
        }
    }

    /// Park instead of rejecting when the gate is currently closed.
    pub fn wait_for_mode(mut self) -> Self {
        self.wait_for_mode = true;
        self
    }
}

/// Supervisory control messages, delivered out of band from the request
/// queue so a restart can reach a scheduler stuck on a hung worker.
#[derive(Debug)]
pub enum TabControl {
    /// Replace the worker, reset the gate to manual.
    Restart {
        reply: oneshot::Sender<StationResult<()>>,
    },
    /// Stop the scheduler and release the worker.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Events published on a tab's broadcast channel: the error sink plus
/// lifecycle notifications, consumed by UIs and supervisors via messages
/// rather than callbacks.
#[derive(Clone, Debug)]
pub enum TabEvent {
    ModeChanged { mode: Mode },
    OperationCompleted { operation: String },
    OperationFailed { operation: String, error: String },
    OperationRejected { operation: String, mode: Mode },
    WorkerRestarted,
    NotResponding,
    RespondingAgain,
}

// =============================================================================
// Task Scheduler
// =============================================================================

pub(crate) struct Pending {
    req: OpRequest,
    op: Operation,
}

/// Single-consumer execution loop for one tab.
pub(crate) struct TaskScheduler {
    pub(crate) tab: Arc<str>,
    pub(crate) registry: Arc<OperationRegistry>,
    pub(crate) gate: StateGate,
    pub(crate) workers: RestartManager,
    pub(crate) queue_rx: mpsc::Receiver<OpRequest>,
    pub(crate) ctrl_rx: mpsc::Receiver<TabControl>,
    pub(crate) events: broadcast::Sender<TabEvent>,
    pub(crate) queue_policy: QueuePolicy,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) responding: Arc<AtomicBool>,
    pub(crate) backlog: VecDeque<Pending>,
    pub(crate) outstanding: HashMap<String, usize>,
    pub(crate) queue_open: bool,
}

impl TaskScheduler {
    pub(crate) async fn run(mut self) {
        info!(tab = %self.tab, "scheduler started");
        loop {
            // Run everything currently admissible, in arrival order.
            self.prune_illegal();
            while let Some(pos) = self.next_runnable() {
                let Some(entry) = self.backlog.remove(pos) else {
                    break;
                };
                if !self.execute(entry).await {
                    return;
                }
                self.prune_illegal();
            }

            if !self.queue_open {
                // Every handle is gone; parked requests can never become
                // runnable once no new transitions can arrive.
                self.teardown().await;
                return;
            }

            // Nothing runnable: wait for a new request or a control
            // message. Mode only changes through operations on this loop,
            // so parked requests cannot become runnable while we wait.
            tokio::select! {
                biased;
                ctrl = self.ctrl_rx.recv() => {
                    match ctrl {
                        Some(ctrl) => {
                            if !self.handle_control(ctrl).await {
                                return;
                            }
                        }
                        None => {
                            self.teardown().await;
                            return;
                        }
                    }
                }
                req = self.queue_rx.recv() => {
                    match req {
                        Some(req) => self.intake(req),
                        None => self.queue_open = false,
                    }
                }
            }
        }
    }

    /// Reject backlogged requests whose mask no longer admits the current
    /// mode and which did not opt into waiting. Legality is re-evaluated
    /// at dequeue time: a transition executed ahead of an entry can
    /// invalidate what was legal when it was queued.
    fn prune_illegal(&mut self) {
        let mode = self.gate.mode();
        let mut index = 0;
        while index < self.backlog.len() {
            let keep = {
                let entry = &self.backlog[index];
                entry.req.wait_for_mode || entry.op.allowed_modes().contains(mode)
            };
            if keep {
                index += 1;
                continue;
            }
            let Some(entry) = self.backlog.remove(index) else {
                break;
            };
            let operation = entry.op.name().to_string();
            self.dec_outstanding(&operation);
            debug!(tab = %self.tab, operation = %operation, %mode, "pruning request made illegal by a mode change");
            let _ = self.events.send(TabEvent::OperationRejected {
                operation: operation.clone(),
                mode,
            });
            if let Some(tx) = entry.req.reply {
                let _ = tx.send(Err(StationError::ModeViolation { operation, mode }));
            }
        }
    }

    fn next_runnable(&self) -> Option<usize> {
        let mode = self.gate.mode();
        self.backlog
            .iter()
            .position(|entry| entry.op.allowed_modes().contains(mode))
    }

    /// Admit, park, coalesce or reject one incoming request, evaluated
    /// against the mode at this instant.
    fn intake(&mut self, req: OpRequest) {
        let Some(op) = self.registry.get(&req.operation) else {
            warn!(tab = %self.tab, operation = %req.operation, "request for unregistered operation");
            if let Some(tx) = req.reply {
                let _ = tx.send(Err(StationError::UnknownOperation(req.operation)));
            }
            return;
        };
        let op = op.clone();

        if op.is_single_outstanding() && self.outstanding_count(op.name()) > 0 {
            debug!(tab = %self.tab, operation = op.name(), "coalescing duplicate request");
            if let Some(tx) = req.reply {
                let _ = tx.send(Ok(WorkValue::None));
            }
            return;
        }

        let mode = self.gate.mode();
        if !op.allowed_modes().contains(mode) && !req.wait_for_mode {
            debug!(tab = %self.tab, operation = op.name(), %mode, "rejecting request outside allowed modes");
            let _ = self.events.send(TabEvent::OperationRejected {
                operation: op.name().to_string(),
                mode,
            });
            if let Some(tx) = req.reply {
                let _ = tx.send(Err(StationError::ModeViolation {
                    operation: req.operation,
                    mode,
                }));
            }
            return;
        }

        *self.outstanding.entry(op.name().to_string()).or_insert(0) += 1;
        self.backlog.push_back(Pending { req, op });
    }

    /// Drive one accepted operation to completion or abort. Returns false
    /// when the scheduler must stop.
    async fn execute(&mut self, entry: Pending) -> bool {
        let Pending { req, op } = entry;
        let op_name = op.name().to_string();
        let OpRequest { id, args, reply, .. } = req;

        debug!(tab = %self.tab, operation = %op_name, request = %id, "operation started");
        self.gate.set_busy(true);
        let ctx = OpContext::new(self.tab.clone(), self.workers.worker(), self.gate.clone());
        let fut = op.run(ctx, args);
        tokio::pin!(fut);

        let result = loop {
            tokio::select! {
                biased;
                ctrl = self.ctrl_rx.recv() => {
                    match ctrl {
                        Some(TabControl::Restart { reply: restart_reply }) => {
                            // Dropping the operation future is the only way
                            // to interrupt its worker await; the request is
                            // failed with `Restarted`.
                            let restarted = self.restart_worker().await;
                            self.dec_outstanding(&op_name);
                            if let Some(tx) = reply {
                                let _ = tx.send(Err(StationError::Restarted));
                            }
                            let _ = restart_reply.send(restarted);
                            return true;
                        }
                        Some(TabControl::Shutdown { reply: shutdown_reply }) => {
                            if let Some(tx) = reply {
                                let _ = tx.send(Err(StationError::TabClosed));
                            }
                            self.teardown().await;
                            let _ = shutdown_reply.send(());
                            return false;
                        }
                        None => {
                            if let Some(tx) = reply {
                                let _ = tx.send(Err(StationError::TabClosed));
                            }
                            self.teardown().await;
                            return false;
                        }
                    }
                }
                // Keep taking requests while the operation runs, so
                // single-outstanding duplicates coalesce against the
                // in-flight instance instead of piling up behind it.
                req = self.queue_rx.recv(), if self.queue_open => {
                    match req {
                        Some(req) => self.intake(req),
                        None => self.queue_open = false,
                    }
                }
                res = &mut fut => break res,
            }
        };

        self.gate.set_busy(false);
        self.dec_outstanding(&op_name);
        match &result {
            Ok(_) => {
                debug!(tab = %self.tab, operation = %op_name, request = %id, "operation completed");
                let _ = self.events.send(TabEvent::OperationCompleted {
                    operation: op_name,
                });
            }
            Err(e) => {
                error!(tab = %self.tab, operation = %op_name, request = %id, error = %e, "operation failed");
                let _ = self.events.send(TabEvent::OperationFailed {
                    operation: op_name,
                    error: e.to_string(),
                });
            }
        }
        if let Some(tx) = reply {
            let _ = tx.send(result);
        }
        true
    }

    async fn handle_control(&mut self, ctrl: TabControl) -> bool {
        match ctrl {
            TabControl::Restart { reply } => {
                let result = self.restart_worker().await;
                let _ = reply.send(result);
                true
            }
            TabControl::Shutdown { reply } => {
                self.teardown().await;
                let _ = reply.send(());
                false
            }
        }
    }

    /// Replace the worker and reset the gate. Queued requests survive or
    /// fail according to the configured queue policy.
    async fn restart_worker(&mut self) -> StationResult<()> {
        warn!(tab = %self.tab, "restarting worker");
        let result = self.workers.restart().await;
        self.gate.set_mode(Mode::Manual);
        self.gate.set_busy(false);
        self.responding.store(true, Ordering::SeqCst);
        if self.queue_policy == QueuePolicy::Drain {
            self.fail_queued(|| StationError::Restarted);
        }
        let _ = self.events.send(TabEvent::WorkerRestarted);
        result
    }

    async fn teardown(&mut self) {
        info!(tab = %self.tab, "tab shutting down");
        self.fail_queued(|| StationError::TabClosed);
        self.workers.shutdown(self.shutdown_timeout).await;
    }

    /// Fail every queued and backlogged request with `make_err`.
    fn fail_queued(&mut self, make_err: impl Fn() -> StationError) {
        for entry in self.backlog.drain(..) {
            if let Some(tx) = entry.req.reply {
                let _ = tx.send(Err(make_err()));
            }
        }
        while let Ok(req) = self.queue_rx.try_recv() {
            if let Some(tx) = req.reply {
                let _ = tx.send(Err(make_err()));
            }
        }
        self.outstanding.clear();
    }

    fn outstanding_count(&self, name: &str) -> usize {
        self.outstanding.get(name).copied().unwrap_or(0)
    }

    fn dec_outstanding(&mut self, name: &str) {
        if let Some(count) = self.outstanding.get_mut(name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.outstanding.remove(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ModeSet;

    fn gate() -> (StateGate, watch::Receiver<TabState>) {
        let (events, _) = broadcast::channel(8);
        StateGate::new(events)
    }

    #[test]
    fn gate_resets_since_on_mode_change() {
        let (gate, rx) = gate();
        let before = rx.borrow().since;
        std::thread::sleep(Duration::from_millis(5));
        gate.set_mode(Mode::Buffered);
        let state = *rx.borrow();
        assert_eq!(state.mode, Mode::Buffered);
        assert!(state.since > before);
    }

    #[test]
    fn gate_checks_allowed_modes() {
        let (gate, _rx) = gate();
        let manual_only = Operation::new("x", ModeSet::only(Mode::Manual), |_, _| async {
            Ok(WorkValue::None)
        });
        assert!(gate.can_run(&manual_only));
        gate.set_mode(Mode::Buffered);
        assert!(!gate.can_run(&manual_only));
    }
}
