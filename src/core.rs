//! Core types and traits for the station execution engine.
//!
//! This module defines the foundational abstractions shared by every device
//! controller ("tab"): the experiment lifecycle mode and its bitmask, the
//! published tab state, the typed work request/reply vocabulary exchanged
//! with worker units, and the [`DeviceDriver`] trait every hardware driver
//! implements on the worker side.
//!
//! # Architecture Overview
//!
//! ```text
//! TabHandle --[request]--> TaskScheduler --[WorkOp]--> Worker thread (DeviceDriver)
//!                              |  ^                          |
//!                              |  '-----[WorkValue]----------'
//!                              '--[TabState]--> watch --> health / liveness
//! ```
//!
//! # Thread Safety
//!
//! Scheduler-side types are `Send` so they can cross into tokio tasks.
//! [`DeviceDriver`] is a synchronous trait: it runs on a dedicated worker
//! thread that owns the hardware connection, so a slow or wedged device
//! never stalls the async runtime.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

// =============================================================================
// Lifecycle Mode
// =============================================================================

/// Experiment lifecycle mode of a tab.
///
/// Transitions between modes are driven only by the buffered/manual
/// transition protocol (see `transitions`), never by arbitrary operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Interactive control; each channel is set individually and immediately.
    Manual,
    /// Hardware is being programmed for a buffered run.
    TransitionToBuffered,
    /// The device executes a pre-computed timeline on an external clock.
    Buffered,
    /// The device is being returned to interactive control.
    TransitionToManual,
}

impl Mode {
    const fn bit(self) -> u8 {
        match self {
            Mode::Manual => 1 << 0,
            Mode::TransitionToBuffered => 1 << 1,
            Mode::Buffered => 1 << 2,
            Mode::TransitionToManual => 1 << 3,
        }
    }

    /// True for the two intermediate programming modes.
    pub const fn is_transition(self) -> bool {
        matches!(self, Mode::TransitionToBuffered | Mode::TransitionToManual)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Manual => "manual",
            Mode::TransitionToBuffered => "transition_to_buffered",
            Mode::Buffered => "buffered",
            Mode::TransitionToManual => "transition_to_manual",
        };
        f.write_str(s)
    }
}

/// Bitmask over the four lifecycle modes.
///
/// Allowed-mode masks are declared as compile-time constants:
///
/// ```rust
/// use labstation::core::{Mode, ModeSet};
///
/// const MANUAL_ONLY: ModeSet = ModeSet::only(Mode::Manual);
/// const ABORTABLE: ModeSet = ModeSet::only(Mode::Buffered).with(Mode::Manual);
/// assert!(ABORTABLE.contains(Mode::Manual));
/// assert!(!MANUAL_ONLY.contains(Mode::Buffered));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeSet(u8);

impl ModeSet {
    /// The empty mask. No mode is admitted.
    pub const EMPTY: ModeSet = ModeSet(0);

    /// All four modes.
    pub const ALL: ModeSet = ModeSet::only(Mode::Manual)
        .with(Mode::TransitionToBuffered)
        .with(Mode::Buffered)
        .with(Mode::TransitionToManual);

    /// Mask admitting exactly one mode.
    pub const fn only(mode: Mode) -> Self {
        ModeSet(mode.bit())
    }

    /// Mask with `mode` added.
    pub const fn with(self, mode: Mode) -> Self {
        ModeSet(self.0 | mode.bit())
    }

    /// Whether `mode` is admitted by this mask.
    pub const fn contains(self, mode: Mode) -> bool {
        self.0 & mode.bit() != 0
    }
}

// =============================================================================
// Tab State and Health
// =============================================================================

/// Published state of a tab.
///
/// Owned exclusively by the tab's scheduler, which publishes it through a
/// `tokio::sync::watch` channel; everyone else (health queries, the liveness
/// monitor) holds read-only receivers. `since` resets on every published
/// change.
#[derive(Clone, Copy, Debug)]
pub struct TabState {
    /// Current lifecycle mode.
    pub mode: Mode,
    /// True while an operation is executing on the scheduler.
    pub busy: bool,
    /// Monotonic instant of the last published change.
    pub since: Instant,
}

impl TabState {
    /// Neutral idle state: manual mode with no operation in flight.
    pub fn is_idle(&self) -> bool {
        self.mode == Mode::Manual && !self.busy
    }
}

impl Default for TabState {
    fn default() -> Self {
        Self {
            mode: Mode::Manual,
            busy: false,
            since: Instant::now(),
        }
    }
}

/// Read-only health snapshot of a tab, for external supervisors and UIs.
#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    /// Current lifecycle mode.
    pub mode: Mode,
    /// Whether an operation is currently executing.
    pub busy: bool,
    /// Time spent in the current state.
    #[serde(with = "humantime_serde")]
    pub in_mode: Duration,
    /// False once the liveness monitor has flagged the tab as stuck.
    pub responding: bool,
}

// =============================================================================
// Values and Channel Maps
// =============================================================================

/// Strongly-typed argument for custom worker operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    FloatArray(Vec<f64>),
    Null,
}

impl ParameterValue {
    /// Extract value as f64, converting integers and parsing strings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(f) => Some(*f),
            ParameterValue::Int(i) => Some(*i as f64),
            ParameterValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Extract value as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(b) => Some(*b),
            ParameterValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Extract value as a string, stringifying scalars.
    pub fn as_string(&self) -> Option<String> {
        match self {
            ParameterValue::String(s) => Some(s.clone()),
            ParameterValue::Bool(b) => Some(b.to_string()),
            ParameterValue::Int(i) => Some(i.to_string()),
            ParameterValue::Float(f) => Some(f.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(b) => write!(f, "{}", b),
            ParameterValue::Int(i) => write!(f, "{}", i),
            ParameterValue::Float(fl) => write!(f, "{}", fl),
            ParameterValue::String(s) => write!(f, "{}", s),
            ParameterValue::FloatArray(arr) => write!(f, "{:?}", arr),
            ParameterValue::Null => write!(f, "null"),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::String(value)
    }
}

impl From<Vec<f64>> for ParameterValue {
    fn from(value: Vec<f64>) -> Self {
        ParameterValue::FloatArray(value)
    }
}

/// Map from hardware channel name to its front-panel value.
///
/// Ordered so snapshots and test assertions are deterministic. Compatible
/// with the persisted front-panel schema (see `panel`): these are the bare
/// values of that richer per-channel record.
pub type ChannelValues = BTreeMap<String, f64>;

/// Reference to a pre-computed experiment timeline.
///
/// The station core never opens the timeline itself; it hands the reference
/// to the worker, whose driver knows the on-disk format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimelineRef {
    /// Path to the compiled timeline artifact.
    pub path: PathBuf,
    /// Optional compiler-provided metadata (shot id, segment, etc.).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl TimelineRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            metadata: None,
        }
    }
}

// =============================================================================
// Worker Request / Reply Vocabulary
// =============================================================================

/// A single request forwarded to a worker unit.
///
/// The protocol entry points are explicit variants; everything else goes
/// through `Custom`, resolved against the worker's registered operation
/// table. Exactly one `WorkOp` is outstanding per worker at any instant.
#[derive(Clone, Debug)]
pub enum WorkOp {
    /// Push the full front-panel channel map to hardware.
    ProgramManual { values: ChannelValues },
    /// Program the hardware for a full buffered sequence.
    TransitionToBuffered {
        device_id: String,
        timeline: TimelineRef,
        initial_values: ChannelValues,
        fresh: bool,
    },
    /// Restore `initial_values` after a failed or cancelled preparation.
    AbortTransitionToBuffered,
    /// Restore `initial_values` from a running buffered state.
    AbortBuffered,
    /// Return to interactive control; `abort` re-applies initial values.
    TransitionToManual { abort: bool },
    /// Release the hardware connection and stop the worker thread.
    Shutdown,
    /// A driver-registered manual-mode operation.
    Custom {
        name: String,
        args: Vec<ParameterValue>,
        kwargs: HashMap<String, ParameterValue>,
    },
}

impl WorkOp {
    /// Stable name for logs and error details.
    pub fn name(&self) -> &str {
        match self {
            WorkOp::ProgramManual { .. } => "program_manual",
            WorkOp::TransitionToBuffered { .. } => "transition_to_buffered",
            WorkOp::AbortTransitionToBuffered => "abort_transition_to_buffered",
            WorkOp::AbortBuffered => "abort_buffered",
            WorkOp::TransitionToManual { .. } => "transition_to_manual",
            WorkOp::Shutdown => "shutdown",
            WorkOp::Custom { name, .. } => name,
        }
    }
}

/// Successful payload of a worker reply.
///
/// Failures travel as `StationError` in the surrounding `Result`, so the
/// wire triple `(success, error, value)` maps onto `Result<WorkValue, _>`.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkValue {
    /// Completed with nothing to report.
    None,
    /// Restoration outcome of the abort entry points.
    Bool(bool),
    /// Result of a custom operation.
    Value(ParameterValue),
    /// Channel map returned by the transition entry points.
    Channels(ChannelValues),
}

impl WorkValue {
    /// Extract the channel map, if this reply carries one.
    pub fn into_channels(self) -> Option<ChannelValues> {
        match self {
            WorkValue::Channels(map) => Some(map),
            _ => None,
        }
    }
}

// =============================================================================
// Device Driver Trait
// =============================================================================

/// Hardware driver contract, executed on the worker thread.
///
/// Implementations own the physical connection. All methods run
/// synchronously; the worker thread serializes them, and the supervisory
/// side only ever talks to the driver through [`WorkOp`] messages. Drivers
/// report failure by returning an error; a panic is contained by the worker
/// and converted into a failure reply, and the tab remains usable.
pub trait DeviceDriver: Send {
    /// Establish the hardware connection. Runs once, before any request.
    fn init(&mut self) -> Result<()>;

    /// Apply the full front-panel channel map; returns the values the
    /// hardware actually accepted (after coercion/quantization).
    fn program_manual(&mut self, values: &ChannelValues) -> Result<ChannelValues>;

    /// Program the device for the full buffered sequence and report the
    /// value each channel will hold at the end of the run.
    ///
    /// `fresh` is false when device settings are unchanged since the last
    /// run, allowing drivers that support smart programming to skip
    /// redundant writes.
    fn transition_to_buffered(
        &mut self,
        device_id: &str,
        timeline: &TimelineRef,
        initial_values: &ChannelValues,
        fresh: bool,
    ) -> Result<ChannelValues>;

    /// Undo a (possibly partial) buffered programming and restore the
    /// snapshot passed to [`DeviceDriver::transition_to_buffered`].
    fn abort_transition_to_buffered(&mut self) -> Result<bool>;

    /// Restore the pre-run snapshot from a running buffered state.
    fn abort_buffered(&mut self) -> Result<bool>;

    /// Return to interactive control. When `abort` is true the pre-run
    /// snapshot is re-applied; otherwise the state reached during the run
    /// is kept.
    fn transition_to_manual(&mut self, abort: bool) -> Result<bool>;

    /// Release the hardware connection.
    fn shutdown(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_set_membership() {
        const MASK: ModeSet = ModeSet::only(Mode::Manual).with(Mode::Buffered);
        assert!(MASK.contains(Mode::Manual));
        assert!(MASK.contains(Mode::Buffered));
        assert!(!MASK.contains(Mode::TransitionToBuffered));
        assert!(!ModeSet::EMPTY.contains(Mode::Manual));
        assert!(ModeSet::ALL.contains(Mode::TransitionToManual));
    }

    #[test]
    fn tab_state_idle() {
        let state = TabState::default();
        assert!(state.is_idle());

        let busy = TabState {
            busy: true,
            ..TabState::default()
        };
        assert!(!busy.is_idle());

        let buffered = TabState {
            mode: Mode::Buffered,
            ..TabState::default()
        };
        assert!(!buffered.is_idle());
    }

    #[test]
    fn parameter_value_conversions() {
        assert_eq!(ParameterValue::Int(7).as_f64(), Some(7.0));
        assert_eq!(ParameterValue::from("1.5").as_f64(), Some(1.5));
        assert_eq!(ParameterValue::Bool(true).as_bool(), Some(true));
        assert_eq!(ParameterValue::Null.as_f64(), None);
        assert_eq!(ParameterValue::Float(2.5).as_string().as_deref(), Some("2.5"));
    }

    #[test]
    fn work_op_names() {
        assert_eq!(WorkOp::AbortBuffered.name(), "abort_buffered");
        let custom = WorkOp::Custom {
            name: "zero_sensor".into(),
            args: vec![],
            kwargs: HashMap::new(),
        };
        assert_eq!(custom.name(), "zero_sensor");
    }
}
