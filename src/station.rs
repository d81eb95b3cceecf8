//! The supervisory station actor.
//!
//! One async task owning every tab. All mutations of the tab set happen
//! here, driven by [`StationCommand`] messages; frontends never touch tabs
//! directly. Operation requests are forwarded through clonable tab handles
//! on spawned forwarders, so one tab's long-running transition never stalls
//! another tab, or the actor itself.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::{DeviceDefinition, Settings};
use crate::core::HealthReport;
use crate::drivers::DriverRegistry;
use crate::error::{StationError, StationResult};
use crate::messages::StationCommand;
use crate::tab::{Tab, TabBuilder};

/// Aggregate health snapshot across the station.
#[derive(Clone, Debug, Serialize)]
pub struct StationHealth {
    /// When the snapshot was taken.
    pub generated_at: DateTime<Utc>,
    /// Per-tab reports, keyed by tab name.
    pub tabs: BTreeMap<String, HealthReport>,
}

/// Actor that manages all tabs.
pub struct Station {
    settings: Settings,
    registry: Arc<DriverRegistry>,
    tabs: HashMap<String, Tab>,
}

impl Station {
    pub fn new(settings: Settings, registry: Arc<DriverRegistry>) -> Self {
        Self {
            settings,
            registry,
            tabs: HashMap::new(),
        }
    }

    /// Runs the actor event loop, processing commands until shutdown.
    ///
    /// Devices enabled in the settings are brought up first; a device that
    /// fails to come up is logged and skipped so the rest of the station
    /// still starts.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<StationCommand>) {
        info!("station started");

        for definition in self.settings.devices.clone() {
            if !definition.enabled {
                continue;
            }
            if let Err(e) = self.create_tab(definition.clone()).await {
                error!(device = %definition.name, error = %e, "failed to bring up device");
            }
        }

        while let Some(command) = command_rx.recv().await {
            match command {
                StationCommand::CreateTab {
                    definition,
                    response,
                } => {
                    let result = self.create_tab(definition).await;
                    let _ = response.send(result);
                }

                StationCommand::Request {
                    tab,
                    operation,
                    args,
                    wait_for_mode,
                    response,
                } => {
                    match self.tabs.get(&tab) {
                        Some(tab) => {
                            // Forward on a separate task: requests complete
                            // in tab order, not station order.
                            let handle = tab.handle();
                            tokio::spawn(async move {
                                let result = if wait_for_mode {
                                    handle.request_waiting(&operation, args).await
                                } else {
                                    handle.request(&operation, args).await
                                };
                                let _ = response.send(result);
                            });
                        }
                        None => {
                            let _ = response.send(Err(StationError::UnknownTab(tab)));
                        }
                    }
                }

                StationCommand::TabHealth { tab, response } => {
                    let result = self
                        .tabs
                        .get(&tab)
                        .map(|t| t.handle().health())
                        .ok_or(StationError::UnknownTab(tab));
                    let _ = response.send(result);
                }

                StationCommand::Health { response } => {
                    let _ = response.send(self.health());
                }

                StationCommand::RestartTab { tab, response } => {
                    match self.tabs.get(&tab) {
                        Some(tab) => {
                            let handle = tab.handle();
                            tokio::spawn(async move {
                                let _ = response.send(handle.restart().await);
                            });
                        }
                        None => {
                            let _ = response.send(Err(StationError::UnknownTab(tab)));
                        }
                    }
                }

                StationCommand::SubscribeEvents { tab, response } => {
                    let result = self
                        .tabs
                        .get(&tab)
                        .map(|t| t.handle().subscribe_events())
                        .ok_or(StationError::UnknownTab(tab));
                    let _ = response.send(result);
                }

                StationCommand::ListTabs { response } => {
                    let mut names: Vec<String> = self.tabs.keys().cloned().collect();
                    names.sort();
                    let _ = response.send(names);
                }

                StationCommand::Shutdown { response } => {
                    info!("shutdown command received");
                    self.shutdown_all().await;
                    let _ = response.send(());
                    break;
                }
            }
        }

        info!("station stopped");
    }

    async fn create_tab(&mut self, definition: DeviceDefinition) -> StationResult<()> {
        if self.tabs.contains_key(&definition.name) {
            return Err(StationError::TabExists(definition.name));
        }

        let spec = self.registry.build(&definition)?;
        let mut builder = TabBuilder::new(definition.name.clone(), spec.factory)
            .station_config(self.settings.station.clone())
            .liveness_config(self.settings.liveness.clone());
        for op in spec.operations {
            builder = builder.operation(op);
        }
        let tab = builder.spawn().await?;

        info!(tab = %definition.name, device_type = %definition.r#type, "tab created");
        self.tabs.insert(definition.name, tab);
        Ok(())
    }

    fn health(&self) -> StationHealth {
        StationHealth {
            generated_at: Utc::now(),
            tabs: self
                .tabs
                .iter()
                .map(|(name, tab)| (name.clone(), tab.handle().health()))
                .collect(),
        }
    }

    async fn shutdown_all(&mut self) {
        let timeout = self.settings.station.shutdown_timeout;
        for (name, tab) in self.tabs.drain() {
            info!(tab = %name, "stopping tab");
            tab.shutdown(timeout).await;
        }
    }
}
