//! Worker lifecycle management: spawn, replace, tear down.
//!
//! The restart manager owns the single live [`WorkerHandle`] of a tab and
//! the factory that builds a replacement of the same type. Restart is the
//! recovery path for a hung or crashed worker: the old unit is told to shut
//! down without waiting (a hung thread never reads the message and is
//! abandoned), a fresh unit is spawned and initialized, and the tab keeps
//! its identity and settings. The caller (the scheduler) is responsible
//! for resetting the gate and disposing of queued requests.

use std::time::Duration;

use tracing::{info, warn};

use crate::core::WorkOp;
use crate::error::StationResult;
use crate::worker::{Worker, WorkerFactory, WorkerHandle};

/// Owns a tab's live worker and its replacement factory.
pub(crate) struct RestartManager {
    tab: String,
    factory: WorkerFactory,
    channel_capacity: usize,
    /// The live handle; `None` only after final teardown.
    handle: Option<WorkerHandle>,
    /// Caller for the current worker. Kept past teardown so late calls
    /// fail fast on the closed channel instead of panicking.
    worker: Worker,
}

impl RestartManager {
    /// Spawn and initialize the first worker for a tab.
    pub(crate) async fn start(
        tab: String,
        factory: WorkerFactory,
        channel_capacity: usize,
    ) -> StationResult<Self> {
        let mut handle = (factory)(channel_capacity);
        handle.wait_init().await?;
        let worker = handle.worker();
        Ok(Self {
            tab,
            factory,
            channel_capacity,
            handle: Some(handle),
            worker,
        })
    }

    /// A caller for the current worker.
    pub(crate) fn worker(&self) -> Worker {
        self.worker.clone()
    }

    /// Replace the worker with a freshly initialized one of the same type.
    ///
    /// The old unit gets a non-blocking shutdown request and is then
    /// abandoned, live or hung. If the replacement fails to initialize the
    /// error is returned and a later restart may try again; the stale
    /// handle is gone either way, so queued calls fail fast instead of
    /// hanging.
    pub(crate) async fn restart(&mut self) -> StationResult<()> {
        info!(tab = %self.tab, "spawning replacement worker");
        let mut fresh = (self.factory)(self.channel_capacity);
        let init = fresh.wait_init().await;
        self.worker = fresh.worker();
        if let Some(old) = self.handle.replace(fresh) {
            old.request_shutdown();
            old.abandon(&self.tab);
        }
        if let Err(e) = &init {
            warn!(tab = %self.tab, error = %e, "replacement worker failed to initialize");
        }
        init
    }

    /// Graceful teardown: ask the worker to release the hardware and give
    /// it `timeout` to comply before abandoning the thread.
    pub(crate) async fn shutdown(&mut self, timeout: Duration) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::time::timeout(timeout, self.worker.call(WorkOp::Shutdown)).await {
            Ok(Ok(_)) => info!(tab = %self.tab, "worker shut down cleanly"),
            Ok(Err(e)) => warn!(tab = %self.tab, error = %e, "worker shutdown reported failure"),
            Err(_) => warn!(tab = %self.tab, "worker shutdown timed out"),
        }
        handle.abandon(&self.tab);
    }
}
