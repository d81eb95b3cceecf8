//! Device driver registry.
//!
//! Tabs are created from configuration by driver type name: the registry
//! maps each type to a builder that turns a [`DeviceDefinition`] into a
//! worker factory plus the tab operations that device class exposes. This
//! is the only path from configuration to running hardware.

use std::collections::HashMap;

use crate::config::DeviceDefinition;
use crate::error::{StationError, StationResult};
use crate::operation::Operation;
use crate::worker::WorkerFactory;

pub mod mock;

/// Everything needed to bring up one tab: the worker factory (retained for
/// restarts) and the controller-specific operations to register.
pub struct DriverSpec {
    pub factory: WorkerFactory,
    pub operations: Vec<Operation>,
}

impl std::fmt::Debug for DriverSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverSpec")
            .field("factory", &"<factory>")
            .field("operations", &self.operations.len())
            .finish()
    }
}

/// Builder resolving a device definition into a [`DriverSpec`].
pub type DriverBuilder = Box<dyn Fn(&DeviceDefinition) -> StationResult<DriverSpec> + Send + Sync>;

/// Registry of driver types available to the station.
#[derive(Default)]
pub struct DriverRegistry {
    builders: HashMap<String, DriverBuilder>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in driver types.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        mock::register(&mut registry);
        registry
    }

    /// Register a driver type. Later registrations win, so applications
    /// can override the built-ins.
    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        builder: impl Fn(&DeviceDefinition) -> StationResult<DriverSpec> + Send + Sync + 'static,
    ) {
        self.builders.insert(type_name.into(), Box::new(builder));
    }

    /// Resolve a device definition against the registered types.
    pub fn build(&self, definition: &DeviceDefinition) -> StationResult<DriverSpec> {
        let builder = self
            .builders
            .get(&definition.r#type)
            .ok_or_else(|| StationError::UnknownDriver(definition.r#type.clone()))?;
        builder(definition)
    }

    pub fn types(&self) -> Vec<&str> {
        self.builders.keys().map(String::as_str).collect()
    }
}
