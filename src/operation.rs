//! Operation definitions and registration.
//!
//! An [`Operation`] is a named unit of work a device controller exposes on
//! its tab: an allowed-mode mask, a single-outstanding flag, and async step
//! logic. The logic's suspension points are its `worker_call` awaits: each
//! hands a typed [`WorkOp`] to the scheduler, which forwards it to the
//! worker and resumes the logic with the typed result. Registration is the
//! only way behavior reaches the scheduler; there is no ad hoc dispatch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::core::{ChannelValues, Mode, ModeSet, ParameterValue, TimelineRef, WorkOp, WorkValue};
use crate::error::{StationError, StationResult};
use crate::scheduler::StateGate;
use crate::worker::Worker;

/// Arguments carried by an operation request.
///
/// Each operation documents the variant it expects and rejects the rest
/// with [`StationError::InvalidArguments`]; the payloads of the engine's
/// built-in operations are part of its typed contract.
#[derive(Clone, Debug)]
pub enum OpArgs {
    /// No payload.
    None,
    /// A front-panel channel map (e.g. `program_manual`).
    Values(ChannelValues),
    /// Payload of `transition_to_buffered`.
    Buffered {
        device_id: String,
        timeline: TimelineRef,
        initial_values: ChannelValues,
        fresh: bool,
    },
    /// Payload of `transition_to_manual`.
    Manual { abort: bool },
    /// Free-form payload for custom operations.
    Custom {
        args: Vec<ParameterValue>,
        kwargs: HashMap<String, ParameterValue>,
    },
}

/// Execution context handed to operation logic.
///
/// Cheap to clone into the operation's future; carries the tab identity,
/// the current worker caller and the state gate. Mode mutation is crate-
/// private: only the built-in transition protocol moves the gate.
#[derive(Clone)]
pub struct OpContext {
    tab: Arc<str>,
    worker: Worker,
    gate: StateGate,
}

impl OpContext {
    pub(crate) fn new(tab: Arc<str>, worker: Worker, gate: StateGate) -> Self {
        Self { tab, worker, gate }
    }

    /// Name of the owning tab.
    pub fn tab(&self) -> &str {
        &self.tab
    }

    /// Current lifecycle mode.
    pub fn mode(&self) -> Mode {
        self.gate.mode()
    }

    /// Suspend until the worker has executed `op` and replied.
    ///
    /// Exactly one request is outstanding per worker; the scheduler loop
    /// waits here while other tabs keep running.
    pub async fn worker_call(&self, op: WorkOp) -> StationResult<WorkValue> {
        self.worker.call(op).await
    }

    pub(crate) fn set_mode(&self, mode: Mode) {
        self.gate.set_mode(mode);
    }
}

type OpLogic = Arc<dyn Fn(OpContext, OpArgs) -> BoxFuture<'static, StationResult<WorkValue>> + Send + Sync>;

/// A registered operation: name, allowed-mode mask, single-outstanding
/// flag and step logic.
#[derive(Clone)]
pub struct Operation {
    name: Arc<str>,
    allowed_modes: ModeSet,
    single_outstanding: bool,
    logic: OpLogic,
}

impl Operation {
    /// Define an operation from an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, allowed_modes: ModeSet, logic: F) -> Self
    where
        F: Fn(OpContext, OpArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = StationResult<WorkValue>> + Send + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            allowed_modes,
            single_outstanding: false,
            logic: Arc::new(move |ctx, args| Box::pin(logic(ctx, args))),
        }
    }

    /// Coalesce re-entrant requests to at most one outstanding instance.
    /// Meant for periodic or edit-driven operations where a backlog of
    /// identical requests has no value.
    pub fn single_outstanding(mut self) -> Self {
        self.single_outstanding = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allowed_modes(&self) -> ModeSet {
        self.allowed_modes
    }

    pub fn is_single_outstanding(&self) -> bool {
        self.single_outstanding
    }

    pub(crate) fn run(&self, ctx: OpContext, args: OpArgs) -> BoxFuture<'static, StationResult<WorkValue>> {
        (self.logic)(ctx, args)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("allowed_modes", &self.allowed_modes)
            .field("single_outstanding", &self.single_outstanding)
            .finish()
    }
}

/// Build a tab operation that forwards its arguments to the worker's
/// custom operation of the same name.
///
/// The standard bridge for driver-registered operations that need no
/// scheduler-side logic of their own.
pub fn forward_to_worker(name: impl Into<String>, allowed_modes: ModeSet) -> Operation {
    let name = name.into();
    let op_name = name.clone();
    Operation::new(name, allowed_modes, move |ctx, args| {
        let op_name = op_name.clone();
        async move {
            let (args, kwargs) = match args {
                OpArgs::Custom { args, kwargs } => (args, kwargs),
                OpArgs::None => (Vec::new(), HashMap::new()),
                _ => {
                    return Err(StationError::InvalidArguments {
                        operation: op_name,
                        expected: "custom operation arguments",
                    });
                }
            };
            ctx.worker_call(WorkOp::Custom {
                name: op_name,
                args,
                kwargs,
            })
            .await
        }
    })
}

/// Per-tab operation table, validated at registration time.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    ops: HashMap<String, Operation>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation; duplicate names are rejected immediately.
    pub fn register(&mut self, op: Operation) -> StationResult<()> {
        if self.ops.contains_key(op.name()) {
            return Err(StationError::DuplicateOperation(op.name().to_string()));
        }
        self.ops.insert(op.name().to_string(), op);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Operation> {
        self.ops.get(name)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
