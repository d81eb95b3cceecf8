//! Liveness monitoring for tab workers.
//!
//! One monitor task per tab, sampling the age of the published tab state on
//! a fixed interval. A tab that is not idle and has not changed state for
//! longer than the threshold is flagged as not responding; the monitor only
//! reports; recovery is the restart manager's job, invoked by an operator
//! or supervisor. Polling cannot distinguish "slow but fine" from "hung"
//! within one interval, so the threshold is a tuning parameter rather than
//! a deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::LivenessConfig;
use crate::core::TabState;
use crate::scheduler::TabEvent;

/// Spawn the monitor task for one tab.
///
/// The task ends on its own once the tab's state channel closes (i.e. the
/// scheduler has stopped).
pub(crate) fn spawn(
    tab: Arc<str>,
    mut state_rx: watch::Receiver<TabState>,
    responding: Arc<AtomicBool>,
    config: LivenessConfig,
    events: broadcast::Sender<TabEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let state = *state_rx.borrow();
                    let stuck = !state.is_idle() && state.since.elapsed() > config.threshold;
                    let was_responding = responding.load(Ordering::SeqCst);
                    if stuck && was_responding {
                        responding.store(false, Ordering::SeqCst);
                        warn!(
                            tab = %tab,
                            mode = %state.mode,
                            stalled_for = ?state.since.elapsed(),
                            "tab is not responding"
                        );
                        let _ = events.send(TabEvent::NotResponding);
                    } else if !stuck && !was_responding {
                        responding.store(true, Ordering::SeqCst);
                        info!(tab = %tab, "tab is responding again");
                        let _ = events.send(TabEvent::RespondingAgain);
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    })
}
