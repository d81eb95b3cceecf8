//! Worker units: isolated execution contexts for hardware I/O.
//!
//! Each tab owns exactly one worker: a dedicated OS thread holding the
//! [`DeviceDriver`] and its hardware connection. Requests arrive over a
//! bounded mpsc channel, each carrying a oneshot reply slot; the protocol is
//! strictly request-then-response, never pipelined, so at most one request
//! is outstanding per worker at any instant.
//!
//! Dispatch is fully typed: the protocol entry points are [`WorkOp`]
//! variants routed to the driver trait, and custom manual-mode operations
//! are resolved against an explicit table built at registration time. A
//! `Custom` name absent from the table is answered with an unknown-operation
//! failure without touching the driver.
//!
//! A failing or panicking driver call never kills the worker: panics are
//! contained and converted into failure replies, and the thread keeps
//! serving requests.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::core::{DeviceDriver, ParameterValue, WorkOp, WorkValue};
use crate::error::{StationError, StationResult};

/// Operation names reserved for the transition protocol; custom table
/// entries may not shadow them.
const RESERVED_NAMES: &[&str] = &[
    "program_manual",
    "transition_to_buffered",
    "abort_transition_to_buffered",
    "abort_buffered",
    "transition_to_manual",
    "shutdown",
];

/// Handler for a driver-registered custom operation.
pub type CustomHandler<D> = Box<
    dyn FnMut(
            &mut D,
            &[ParameterValue],
            &HashMap<String, ParameterValue>,
        ) -> anyhow::Result<ParameterValue>
        + Send,
>;

/// One request on the worker's channel: the operation plus its reply slot.
#[derive(Debug)]
pub struct WorkRequest {
    pub op: WorkOp,
    pub reply: oneshot::Sender<StationResult<WorkValue>>,
}

/// Clonable supervisory-side caller for a worker unit.
///
/// Held by the scheduler and by operation contexts. When the underlying
/// worker has been replaced or torn down, calls fail with
/// [`StationError::Restarted`].
#[derive(Clone)]
pub struct Worker {
    request_tx: mpsc::Sender<WorkRequest>,
}

impl Worker {
    /// Forward one request and wait for its reply.
    pub async fn call(&self, op: WorkOp) -> StationResult<WorkValue> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(WorkRequest {
                op,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StationError::Restarted)?;
        reply_rx.await.map_err(|_| StationError::Restarted)?
    }
}

/// Supervisory-side reference to a spawned worker: caller, thread handle
/// and the one-shot initialization outcome. Owned by the restart manager;
/// exactly one live handle exists per tab.
pub struct WorkerHandle {
    worker: Worker,
    thread: Option<std::thread::JoinHandle<()>>,
    init: Option<oneshot::Receiver<StationResult<()>>>,
}

impl WorkerHandle {
    /// A clonable caller for this worker.
    pub fn worker(&self) -> Worker {
        self.worker.clone()
    }

    /// Wait for the worker thread to finish running the driver's `init()`.
    pub async fn wait_init(&mut self) -> StationResult<()> {
        match self.init.take() {
            Some(rx) => rx.await.map_err(|_| StationError::Restarted)?,
            None => Ok(()),
        }
    }

    /// Ask the worker to shut down without waiting for the reply. A hung
    /// worker never reads the message; the caller is expected to abandon
    /// the handle afterwards.
    pub fn request_shutdown(&self) {
        let (reply_tx, _reply_rx) = oneshot::channel();
        let _ = self.worker.request_tx.try_send(WorkRequest {
            op: WorkOp::Shutdown,
            reply: reply_tx,
        });
    }

    /// Drop the channels and detach the thread. A responsive worker exits
    /// as soon as it observes the closed channel; a hung one is left to the
    /// OS, which is as close to forceful termination as a thread allows.
    pub fn abandon(mut self, tab: &str) {
        if let Some(thread) = self.thread.take() {
            if !thread.is_finished() {
                warn!(tab, "abandoning unresponsive worker thread");
            }
        }
    }
}

/// Factory that builds a fresh worker for a tab. Stored by the restart
/// manager so a replacement of the same type can be spawned at any time.
pub type WorkerFactory = std::sync::Arc<dyn Fn(usize) -> WorkerHandle + Send + Sync>;

/// Builder coupling a driver with its validated custom-operation table.
pub struct WorkerBuilder<D: DeviceDriver + 'static> {
    name: String,
    driver: D,
    ops: HashMap<String, CustomHandler<D>>,
}

impl<D: DeviceDriver + 'static> std::fmt::Debug for WorkerBuilder<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerBuilder")
            .field("name", &self.name)
            .field("ops", &self.ops.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<D: DeviceDriver + 'static> WorkerBuilder<D> {
    pub fn new(name: impl Into<String>, driver: D) -> Self {
        Self {
            name: name.into(),
            driver,
            ops: HashMap::new(),
        }
    }

    /// Register a custom manual-mode operation. Duplicate names and names
    /// shadowing the protocol entry points are rejected here, at
    /// registration time.
    pub fn operation<F>(mut self, name: impl Into<String>, handler: F) -> StationResult<Self>
    where
        F: FnMut(
                &mut D,
                &[ParameterValue],
                &HashMap<String, ParameterValue>,
            ) -> anyhow::Result<ParameterValue>
            + Send
            + 'static,
    {
        let name = name.into();
        if RESERVED_NAMES.contains(&name.as_str()) || self.ops.contains_key(&name) {
            return Err(StationError::DuplicateOperation(name));
        }
        self.ops.insert(name, Box::new(handler));
        Ok(self)
    }

    /// Spawn the worker thread. The driver's `init()` runs on the thread
    /// before the request loop; its outcome arrives on the handle's init
    /// receiver.
    pub fn spawn(self, channel_capacity: usize) -> WorkerHandle {
        let (request_tx, request_rx) = mpsc::channel(channel_capacity);
        let (init_tx, init_rx) = oneshot::channel();

        let name = self.name;
        let driver = self.driver;
        let ops = self.ops;
        let thread = std::thread::Builder::new()
            .name(format!("worker-{}", name))
            .spawn(move || run_worker(name, driver, ops, request_rx, init_tx))
            .unwrap_or_else(|e| {
                // Out of threads is unrecoverable for the process anyway.
                panic!("failed to spawn worker thread: {}", e)
            });

        WorkerHandle {
            worker: Worker { request_tx },
            thread: Some(thread),
            init: Some(init_rx),
        }
    }
}

// =============================================================================
// Worker Thread
// =============================================================================

fn run_worker<D: DeviceDriver>(
    name: String,
    mut driver: D,
    mut ops: HashMap<String, CustomHandler<D>>,
    mut request_rx: mpsc::Receiver<WorkRequest>,
    init_tx: oneshot::Sender<StationResult<()>>,
) {
    let init_result = contain(&mut driver, &mut ops, "init", |driver, _| {
        driver.init().map(|_| WorkValue::None)
    })
    .map(|_| ());
    let init_ok = init_result.is_ok();
    let _ = init_tx.send(init_result);
    if !init_ok {
        return;
    }
    info!(worker = %name, "worker initialized");

    let mut clean_exit = false;
    while let Some(WorkRequest { op, reply }) = request_rx.blocking_recv() {
        let is_shutdown = matches!(op, WorkOp::Shutdown);
        debug!(worker = %name, op = op.name(), "executing work request");
        let result = execute(&mut driver, &mut ops, op);
        let _ = reply.send(result);
        if is_shutdown {
            clean_exit = true;
            break;
        }
    }

    if !clean_exit {
        // Channel dropped without an explicit shutdown (tab torn down or
        // worker replaced); release the hardware on the way out.
        if let Err(e) = contain(&mut driver, &mut ops, "shutdown", |driver, _| {
            driver.shutdown().map(|_| WorkValue::None)
        }) {
            warn!(worker = %name, error = %e, "driver shutdown failed");
        }
    }
    info!(worker = %name, "worker stopped");
}

fn execute<D: DeviceDriver>(
    driver: &mut D,
    ops: &mut HashMap<String, CustomHandler<D>>,
    op: WorkOp,
) -> StationResult<WorkValue> {
    // No such table entry: answered without attempting execution.
    if let WorkOp::Custom { name, .. } = &op {
        if !ops.contains_key(name) {
            return Err(StationError::UnknownOperation(name.clone()));
        }
    }

    let op_name = op.name().to_string();
    contain(driver, ops, &op_name, move |driver, ops| dispatch(driver, ops, op))
}

/// Run a driver call with panic containment. The driver may be left in an
/// arbitrary state after a caught panic; the failure reply and the restart
/// path cover that case.
fn contain<D: DeviceDriver>(
    driver: &mut D,
    ops: &mut HashMap<String, CustomHandler<D>>,
    op_name: &str,
    call: impl FnOnce(&mut D, &mut HashMap<String, CustomHandler<D>>) -> anyhow::Result<WorkValue>,
) -> StationResult<WorkValue> {
    match panic::catch_unwind(AssertUnwindSafe(|| call(driver, ops))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(StationError::worker_failure(op_name, format!("{:#}", e))),
        Err(payload) => Err(StationError::worker_failure(op_name, panic_detail(&payload))),
    }
}

fn dispatch<D: DeviceDriver>(
    driver: &mut D,
    ops: &mut HashMap<String, CustomHandler<D>>,
    op: WorkOp,
) -> anyhow::Result<WorkValue> {
    match op {
        WorkOp::ProgramManual { values } => {
            Ok(WorkValue::Channels(driver.program_manual(&values)?))
        }
        WorkOp::TransitionToBuffered {
            device_id,
            timeline,
            initial_values,
            fresh,
        } => Ok(WorkValue::Channels(driver.transition_to_buffered(
            &device_id,
            &timeline,
            &initial_values,
            fresh,
        )?)),
        WorkOp::AbortTransitionToBuffered => {
            Ok(WorkValue::Bool(driver.abort_transition_to_buffered()?))
        }
        WorkOp::AbortBuffered => Ok(WorkValue::Bool(driver.abort_buffered()?)),
        WorkOp::TransitionToManual { abort } => {
            Ok(WorkValue::Bool(driver.transition_to_manual(abort)?))
        }
        WorkOp::Shutdown => {
            driver.shutdown()?;
            Ok(WorkValue::None)
        }
        WorkOp::Custom { name, args, kwargs } => {
            let handler = ops
                .get_mut(&name)
                .ok_or_else(|| anyhow::anyhow!("no operation named '{}'", name))?;
            Ok(WorkValue::Value(handler(driver, &args, &kwargs)?))
        }
    }
}

fn panic_detail(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic: <non-string payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChannelValues, TimelineRef};
    use anyhow::bail;

    /// Minimal in-memory driver for worker-level tests.
    struct ScratchDriver {
        panel: ChannelValues,
        fail_init: bool,
    }

    impl ScratchDriver {
        fn new() -> Self {
            Self {
                panel: ChannelValues::new(),
                fail_init: false,
            }
        }
    }

    impl DeviceDriver for ScratchDriver {
        fn init(&mut self) -> anyhow::Result<()> {
            if self.fail_init {
                bail!("no device on bus");
            }
            Ok(())
        }

        fn program_manual(&mut self, values: &ChannelValues) -> anyhow::Result<ChannelValues> {
            self.panel = values.clone();
            Ok(self.panel.clone())
        }

        fn transition_to_buffered(
            &mut self,
            _device_id: &str,
            _timeline: &TimelineRef,
            initial_values: &ChannelValues,
            _fresh: bool,
        ) -> anyhow::Result<ChannelValues> {
            Ok(initial_values.clone())
        }

        fn abort_transition_to_buffered(&mut self) -> anyhow::Result<bool> {
            Ok(true)
        }

        fn abort_buffered(&mut self) -> anyhow::Result<bool> {
            Ok(true)
        }

        fn transition_to_manual(&mut self, _abort: bool) -> anyhow::Result<bool> {
            Ok(true)
        }

        fn shutdown(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn custom(name: &str) -> WorkOp {
        WorkOp::Custom {
            name: name.to_string(),
            args: vec![],
            kwargs: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn unknown_custom_op_is_rejected_without_execution() {
        let mut handle = WorkerBuilder::new("t", ScratchDriver::new()).spawn(4);
        handle.wait_init().await.unwrap();
        let worker = handle.worker();

        let err = worker.call(custom("missing")).await.unwrap_err();
        assert!(matches!(err, StationError::UnknownOperation(name) if name == "missing"));

        // The worker is still serving requests.
        let value = worker
            .call(WorkOp::ProgramManual {
                values: ChannelValues::new(),
            })
            .await
            .unwrap();
        assert_eq!(value, WorkValue::Channels(ChannelValues::new()));
        worker.call(WorkOp::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let mut handle = WorkerBuilder::new("t", ScratchDriver::new())
            .operation("explode", |_, _, _| panic!("boom"))
            .unwrap()
            .spawn(4);
        handle.wait_init().await.unwrap();
        let worker = handle.worker();

        let err = worker.call(custom("explode")).await.unwrap_err();
        match err {
            StationError::WorkerExecution { detail, .. } => assert!(detail.contains("boom")),
            other => panic!("unexpected error: {other}"),
        }

        // Panic did not kill the thread.
        worker.call(WorkOp::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn failed_init_is_reported() {
        let mut driver = ScratchDriver::new();
        driver.fail_init = true;
        let mut handle = WorkerBuilder::new("t", driver).spawn(4);
        let err = handle.wait_init().await.unwrap_err();
        assert!(err.to_string().contains("no device on bus"));
    }

    #[test]
    fn reserved_names_rejected_at_registration() {
        let builder = WorkerBuilder::new("t", ScratchDriver::new());
        let err = builder
            .operation("transition_to_buffered", |_, _, _| {
                Ok(ParameterValue::Null)
            })
            .unwrap_err();
        assert!(matches!(err, StationError::DuplicateOperation(_)));
    }
}
