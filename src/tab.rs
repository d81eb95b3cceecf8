//! Tab assembly and the public tab handle.
//!
//! A tab is one managed device controller: scheduler, gate, worker and
//! liveness monitor wired together. [`TabBuilder`] assembles the pieces;
//! [`TabHandle`] is the clonable supervisory-side interface used to queue
//! operations, query health, subscribe to events, and request restart or
//! shutdown.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::{LivenessConfig, StationConfig};
use crate::core::{HealthReport, TabState, WorkValue};
use crate::error::{StationError, StationResult};
use crate::liveness;
use crate::operation::{OpArgs, Operation, OperationRegistry};
use crate::restart::RestartManager;
use crate::scheduler::{OpRequest, StateGate, TabControl, TabEvent, TaskScheduler};
use crate::transitions::builtin_operations;
use crate::worker::WorkerFactory;

/// Builder for one device controller instance.
pub struct TabBuilder {
    name: String,
    factory: WorkerFactory,
    operations: Vec<Operation>,
    station: StationConfig,
    liveness: LivenessConfig,
}

impl TabBuilder {
    pub fn new(name: impl Into<String>, factory: WorkerFactory) -> Self {
        Self {
            name: name.into(),
            factory,
            operations: Vec::new(),
            station: StationConfig::default(),
            liveness: LivenessConfig::default(),
        }
    }

    /// Register a controller-specific operation on top of the built-in
    /// transition protocol.
    pub fn operation(mut self, op: Operation) -> Self {
        self.operations.push(op);
        self
    }

    pub fn station_config(mut self, config: StationConfig) -> Self {
        self.station = config;
        self
    }

    pub fn liveness_config(mut self, config: LivenessConfig) -> Self {
        self.liveness = config;
        self
    }

    /// Spawn the worker (running its `init()`), the scheduler task and the
    /// liveness monitor. Fails if the worker cannot initialize or an
    /// operation name collides.
    pub async fn spawn(self) -> StationResult<Tab> {
        let mut registry = OperationRegistry::new();
        for op in builtin_operations() {
            registry.register(op)?;
        }
        for op in self.operations {
            registry.register(op)?;
        }
        let registry = Arc::new(registry);

        let (events, _) = broadcast::channel(self.station.event_capacity);
        let (gate, state_rx) = StateGate::new(events.clone());
        let responding = Arc::new(AtomicBool::new(true));

        let workers = RestartManager::start(
            self.name.clone(),
            self.factory,
            self.station.worker_channel_capacity,
        )
        .await?;

        let (queue_tx, queue_rx) = mpsc::channel(self.station.queue_capacity);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(4);
        let name: Arc<str> = Arc::from(self.name);

        let scheduler = TaskScheduler {
            tab: name.clone(),
            registry,
            gate,
            workers,
            queue_rx,
            ctrl_rx,
            events: events.clone(),
            queue_policy: self.station.restart_queue_policy,
            shutdown_timeout: self.station.shutdown_timeout,
            responding: responding.clone(),
            backlog: VecDeque::new(),
            outstanding: HashMap::new(),
            queue_open: true,
        };
        let scheduler_task = tokio::spawn(scheduler.run());
        let monitor_task = liveness::spawn(
            name.clone(),
            state_rx.clone(),
            responding.clone(),
            self.liveness,
            events.clone(),
        );

        Ok(Tab {
            handle: TabHandle {
                name,
                queue_tx,
                ctrl_tx,
                state_rx,
                responding,
                events,
            },
            scheduler: scheduler_task,
            monitor: monitor_task,
        })
    }
}

/// A running device controller: its handle plus the background tasks.
pub struct Tab {
    handle: TabHandle,
    scheduler: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl Tab {
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// A clonable handle for queueing operations and querying health.
    pub fn handle(&self) -> TabHandle {
        self.handle.clone()
    }

    /// Graceful stop: drains the scheduler, releases the worker, and waits
    /// up to `timeout` for the background tasks before aborting them.
    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.handle.shutdown().await;
        if tokio::time::timeout(timeout, self.scheduler).await.is_err() {
            warn!(tab = %self.handle.name, "scheduler did not stop in time");
        }
        // The monitor exits once the state channel closes.
        if tokio::time::timeout(timeout, self.monitor).await.is_err() {
            warn!(tab = %self.handle.name, "liveness monitor did not stop in time");
        }
    }
}

/// Clonable supervisory-side interface to one tab.
#[derive(Clone)]
pub struct TabHandle {
    name: Arc<str>,
    queue_tx: mpsc::Sender<OpRequest>,
    ctrl_tx: mpsc::Sender<TabControl>,
    state_rx: watch::Receiver<TabState>,
    responding: Arc<AtomicBool>,
    events: broadcast::Sender<TabEvent>,
}

impl TabHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an operation and wait for its finalization result. Rejected
    /// immediately with [`StationError::ModeViolation`] if the current mode
    /// is outside the operation's mask.
    pub async fn request(&self, operation: &str, args: OpArgs) -> StationResult<WorkValue> {
        let (req, rx) = OpRequest::with_reply(operation, args);
        self.send(req, rx).await
    }

    /// Like [`TabHandle::request`], but an illegal request parks until the
    /// gate opens instead of failing.
    pub async fn request_waiting(&self, operation: &str, args: OpArgs) -> StationResult<WorkValue> {
        let (req, rx) = OpRequest::with_reply(operation, args);
        self.send(req.wait_for_mode(), rx).await
    }

    /// Queue an operation without waiting for its result. Failures surface
    /// on the event channel only.
    pub async fn submit(&self, operation: &str, args: OpArgs) -> StationResult<()> {
        self.queue_tx
            .send(OpRequest::fire_and_forget(operation, args))
            .await
            .map_err(|_| StationError::TabClosed)
    }

    async fn send(
        &self,
        req: OpRequest,
        rx: oneshot::Receiver<StationResult<WorkValue>>,
    ) -> StationResult<WorkValue> {
        self.queue_tx
            .send(req)
            .await
            .map_err(|_| StationError::TabClosed)?;
        rx.await.map_err(|_| StationError::TabClosed)?
    }

    /// Read-only health snapshot: mode, time in mode, responding flag.
    pub fn health(&self) -> HealthReport {
        let state = *self.state_rx.borrow();
        HealthReport {
            mode: state.mode,
            busy: state.busy,
            in_mode: state.since.elapsed(),
            responding: self.responding.load(Ordering::SeqCst),
        }
    }

    /// Current published state.
    pub fn state(&self) -> TabState {
        *self.state_rx.borrow()
    }

    /// Guard for supervisors: an error while the liveness monitor has the
    /// tab flagged as not responding.
    pub fn ensure_responding(&self) -> StationResult<()> {
        if self.responding.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StationError::WorkerUnresponsive {
                tab: self.name.to_string(),
            })
        }
    }

    /// Subscribe to the tab's event channel.
    pub fn subscribe_events(&self) -> broadcast::Receiver<TabEvent> {
        self.events.subscribe()
    }

    /// Tear down the worker (hung or live) and replace it with a freshly
    /// initialized one; the gate resets to manual.
    pub async fn restart(&self) -> StationResult<()> {
        let (reply, rx) = oneshot::channel();
        self.ctrl_tx
            .send(TabControl::Restart { reply })
            .await
            .map_err(|_| StationError::TabClosed)?;
        rx.await.map_err(|_| StationError::TabClosed)?
    }

    /// Stop the tab's scheduler and release the worker.
    pub async fn shutdown(&self) -> StationResult<()> {
        let (reply, rx) = oneshot::channel();
        if self
            .ctrl_tx
            .send(TabControl::Shutdown { reply })
            .await
            .is_err()
        {
            // Already down.
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }
}
