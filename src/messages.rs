//! Message types for the supervisory station actor.
//!
//! This module defines the command types used for message-passing between
//! external frontends (CLI, UI, remote supervisors) and the [`Station`]
//! actor. Every command carries a oneshot responder; the helper
//! constructors return the command together with its receiver.
//!
//! [`Station`]: crate::station::Station

use tokio::sync::{broadcast, oneshot};

use crate::config::DeviceDefinition;
use crate::core::{HealthReport, WorkValue};
use crate::error::StationResult;
use crate::operation::OpArgs;
use crate::scheduler::TabEvent;
use crate::station::StationHealth;

/// Commands that can be sent to the station actor.
#[derive(Debug)]
pub enum StationCommand {
    /// Create and bring up a new tab from a device definition.
    CreateTab {
        definition: DeviceDefinition,
        response: oneshot::Sender<StationResult<()>>,
    },

    /// Queue an operation on a tab and deliver its finalization result.
    Request {
        tab: String,
        operation: String,
        args: OpArgs,
        /// Park instead of rejecting when the gate is currently closed.
        wait_for_mode: bool,
        response: oneshot::Sender<StationResult<WorkValue>>,
    },

    /// Health snapshot of one tab.
    TabHealth {
        tab: String,
        response: oneshot::Sender<StationResult<HealthReport>>,
    },

    /// Health snapshot of every tab.
    Health {
        response: oneshot::Sender<StationHealth>,
    },

    /// Replace a tab's worker with a freshly initialized one.
    RestartTab {
        tab: String,
        response: oneshot::Sender<StationResult<()>>,
    },

    /// Subscribe to a tab's event channel.
    SubscribeEvents {
        tab: String,
        response: oneshot::Sender<StationResult<broadcast::Receiver<TabEvent>>>,
    },

    /// Names of all running tabs.
    ListTabs {
        response: oneshot::Sender<Vec<String>>,
    },

    /// Shut down every tab and stop the actor.
    Shutdown { response: oneshot::Sender<()> },
}

impl StationCommand {
    /// Helper to create a CreateTab command.
    pub fn create_tab(
        definition: DeviceDefinition,
    ) -> (Self, oneshot::Receiver<StationResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::CreateTab {
                definition,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Request command.
    pub fn request(
        tab: impl Into<String>,
        operation: impl Into<String>,
        args: OpArgs,
    ) -> (Self, oneshot::Receiver<StationResult<WorkValue>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Request {
                tab: tab.into(),
                operation: operation.into(),
                args,
                wait_for_mode: false,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Request command that parks until its mode opens.
    pub fn request_waiting(
        tab: impl Into<String>,
        operation: impl Into<String>,
        args: OpArgs,
    ) -> (Self, oneshot::Receiver<StationResult<WorkValue>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Request {
                tab: tab.into(),
                operation: operation.into(),
                args,
                wait_for_mode: true,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a TabHealth command.
    pub fn tab_health(
        tab: impl Into<String>,
    ) -> (Self, oneshot::Receiver<StationResult<HealthReport>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::TabHealth {
                tab: tab.into(),
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Health command.
    pub fn health() -> (Self, oneshot::Receiver<StationHealth>) {
        let (tx, rx) = oneshot::channel();
        (Self::Health { response: tx }, rx)
    }

    /// Helper to create a RestartTab command.
    pub fn restart_tab(tab: impl Into<String>) -> (Self, oneshot::Receiver<StationResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::RestartTab {
                tab: tab.into(),
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a SubscribeEvents command.
    pub fn subscribe_events(
        tab: impl Into<String>,
    ) -> (
        Self,
        oneshot::Receiver<StationResult<broadcast::Receiver<TabEvent>>>,
    ) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SubscribeEvents {
                tab: tab.into(),
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a ListTabs command.
    pub fn list_tabs() -> (Self, oneshot::Receiver<Vec<String>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ListTabs { response: tx }, rx)
    }

    /// Helper to create a Shutdown command.
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
