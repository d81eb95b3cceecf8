//! The buffered/manual transition protocol.
//!
//! These are the built-in operations registered on every tab. They are the
//! only code allowed to move the state gate; device controllers add custom
//! manual-mode operations on top but never drive mode changes themselves.
//!
//! State machine:
//!
//! ```text
//!              transition_to_buffered
//!   MANUAL ───────────────────────────> TRANSITION_TO_BUFFERED
//!     ^  ^                                  │           │
//!     │  └── abort_transition_to_buffered ──┘           │ (worker ok)
//!     │                                                 v
//!     │          abort_buffered                     BUFFERED
//!     ├──────────────────────────────────────────────┘  │
//!     │                                                 │ transition_to_manual
//!     │                                                 v
//!     └──────────────────────────────────── TRANSITION_TO_MANUAL
//! ```
//!
//! If two abort requests race, the first dequeued performs the restoration;
//! the second observes the gate already back in manual and is a no-op
//! success.

use crate::core::{Mode, ModeSet, WorkOp, WorkValue};
use crate::error::StationError;
use crate::operation::{OpArgs, Operation};

/// Operation name: push the front panel to hardware.
pub const PROGRAM_MANUAL: &str = "program_manual";
/// Operation name: program the device for a buffered run.
pub const TRANSITION_TO_BUFFERED: &str = "transition_to_buffered";
/// Operation name: cancel a preparation in progress.
pub const ABORT_TRANSITION_TO_BUFFERED: &str = "abort_transition_to_buffered";
/// Operation name: abort a running buffered sequence.
pub const ABORT_BUFFERED: &str = "abort_buffered";
/// Operation name: return to interactive control after a run.
pub const TRANSITION_TO_MANUAL: &str = "transition_to_manual";

/// The protocol operations every tab registers at construction.
pub fn builtin_operations() -> Vec<Operation> {
    vec![
        program_manual(),
        transition_to_buffered(),
        abort_transition_to_buffered(),
        abort_buffered(),
        transition_to_manual(),
    ]
}

/// Manual-mode front-panel programming.
///
/// Single-outstanding: rapid panel edits coalesce to at most one
/// outstanding hardware write instead of piling up.
fn program_manual() -> Operation {
    Operation::new(
        PROGRAM_MANUAL,
        ModeSet::only(Mode::Manual),
        |ctx, args| async move {
            let OpArgs::Values(values) = args else {
                return Err(StationError::InvalidArguments {
                    operation: PROGRAM_MANUAL.into(),
                    expected: "a channel value map",
                });
            };
            ctx.worker_call(WorkOp::ProgramManual { values }).await
        },
    )
    .single_outstanding()
}

/// `MANUAL -> TRANSITION_TO_BUFFERED -> BUFFERED`.
///
/// On worker failure the gate stays in `TRANSITION_TO_BUFFERED`:
/// `abort_transition_to_buffered` is the only exit back to manual, so the
/// partially programmed device is never silently presented as interactive.
fn transition_to_buffered() -> Operation {
    Operation::new(
        TRANSITION_TO_BUFFERED,
        ModeSet::only(Mode::Manual),
        |ctx, args| async move {
            let OpArgs::Buffered {
                device_id,
                timeline,
                initial_values,
                fresh,
            } = args
            else {
                return Err(StationError::InvalidArguments {
                    operation: TRANSITION_TO_BUFFERED.into(),
                    expected: "buffered-run arguments",
                });
            };
            ctx.set_mode(Mode::TransitionToBuffered);
            let final_values = ctx
                .worker_call(WorkOp::TransitionToBuffered {
                    device_id,
                    timeline,
                    initial_values,
                    fresh,
                })
                .await?;
            ctx.set_mode(Mode::Buffered);
            Ok(final_values)
        },
    )
}

/// Cancel a preparation and restore the pre-run snapshot.
fn abort_transition_to_buffered() -> Operation {
    Operation::new(
        ABORT_TRANSITION_TO_BUFFERED,
        ModeSet::only(Mode::TransitionToBuffered).with(Mode::Manual),
        |ctx, _args| async move {
            if ctx.mode() == Mode::Manual {
                // Lost the race against another abort; already restored.
                return Ok(WorkValue::Bool(true));
            }
            let restored = ctx.worker_call(WorkOp::AbortTransitionToBuffered).await?;
            ctx.set_mode(Mode::Manual);
            Ok(restored)
        },
    )
}

/// Abort a running buffered sequence and restore the pre-run snapshot.
fn abort_buffered() -> Operation {
    Operation::new(
        ABORT_BUFFERED,
        ModeSet::only(Mode::Buffered).with(Mode::Manual),
        |ctx, _args| async move {
            if ctx.mode() == Mode::Manual {
                return Ok(WorkValue::Bool(true));
            }
            let restored = ctx.worker_call(WorkOp::AbortBuffered).await?;
            ctx.set_mode(Mode::Manual);
            Ok(restored)
        },
    )
}

/// `BUFFERED -> TRANSITION_TO_MANUAL -> MANUAL`, at the end of a run.
fn transition_to_manual() -> Operation {
    Operation::new(
        TRANSITION_TO_MANUAL,
        ModeSet::only(Mode::Buffered),
        |ctx, args| async move {
            let OpArgs::Manual { abort } = args else {
                return Err(StationError::InvalidArguments {
                    operation: TRANSITION_TO_MANUAL.into(),
                    expected: "an abort flag",
                });
            };
            ctx.set_mode(Mode::TransitionToManual);
            let kept = ctx.worker_call(WorkOp::TransitionToManual { abort }).await?;
            ctx.set_mode(Mode::Manual);
            Ok(kept)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_masks() {
        let ops = builtin_operations();
        let get = |name: &str| {
            ops.iter()
                .find(|op| op.name() == name)
                .unwrap()
                .allowed_modes()
        };

        assert!(get(PROGRAM_MANUAL).contains(Mode::Manual));
        assert!(!get(PROGRAM_MANUAL).contains(Mode::Buffered));

        assert!(get(ABORT_TRANSITION_TO_BUFFERED).contains(Mode::TransitionToBuffered));
        assert!(get(ABORT_TRANSITION_TO_BUFFERED).contains(Mode::Manual));
        assert!(!get(ABORT_TRANSITION_TO_BUFFERED).contains(Mode::Buffered));

        assert!(get(TRANSITION_TO_MANUAL).contains(Mode::Buffered));
        assert!(!get(TRANSITION_TO_MANUAL).contains(Mode::Manual));
    }

    #[test]
    fn program_manual_is_single_outstanding() {
        let ops = builtin_operations();
        let pm = ops.iter().find(|op| op.name() == PROGRAM_MANUAL).unwrap();
        assert!(pm.is_single_outstanding());
        let tb = ops
            .iter()
            .find(|op| op.name() == TRANSITION_TO_BUFFERED)
            .unwrap();
        assert!(!tb.is_single_outstanding());
    }
}
