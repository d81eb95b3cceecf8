//! Front-panel value snapshots.
//!
//! The front panel is the manual-mode channel state shown to and edited by
//! an operator. It is persisted as a JSON map from hardware channel name to
//! `{value, locked, step_size, unit}`, the schema read at controller
//! startup and written back on settings save. The engine's
//! `initial_values`/`final_values` maps are the bare values of these
//! records: [`FrontPanel::values`] produces the snapshot handed to
//! `transition_to_buffered`, and [`FrontPanel::apply_values`] folds the
//! worker's final values back in so the display stays consistent without
//! polling hardware.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::ChannelValues;
use crate::error::StationResult;

/// One front-panel channel record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelValue {
    /// Current output value.
    pub value: f64,
    /// Operator lock: the UI refuses edits while set.
    #[serde(default)]
    pub locked: bool,
    /// Step increment for the UI spin control.
    #[serde(default = "default_step_size")]
    pub step_size: f64,
    /// Physical unit label.
    #[serde(default)]
    pub unit: String,
}

fn default_step_size() -> f64 {
    1.0
}

impl ChannelValue {
    pub fn new(value: f64, unit: impl Into<String>) -> Self {
        Self {
            value,
            locked: false,
            step_size: default_step_size(),
            unit: unit.into(),
        }
    }
}

/// The full manual-mode snapshot of a device, keyed by channel name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrontPanel {
    channels: BTreeMap<String, ChannelValue>,
}

impl FrontPanel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a snapshot from disk.
    pub fn load(path: &Path) -> StationResult<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write the snapshot to disk as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> StationResult<()> {
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }

    pub fn insert(&mut self, name: impl Into<String>, channel: ChannelValue) {
        self.channels.insert(name.into(), channel);
    }

    pub fn get(&self, name: &str) -> Option<&ChannelValue> {
        self.channels.get(name)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ChannelValue)> {
        self.channels.iter()
    }

    /// The bare value map, in the shape the transition protocol exchanges
    /// with workers.
    pub fn values(&self) -> ChannelValues {
        self.channels
            .iter()
            .map(|(name, ch)| (name.clone(), ch.value))
            .collect()
    }

    /// Fold a value map (e.g. the final values of a buffered run) back
    /// into the panel. Channels the device did not report keep their
    /// current value; names not present on the panel are ignored, since a
    /// worker cannot invent channels.
    pub fn apply_values(&mut self, values: &ChannelValues) {
        for (name, value) in values {
            if let Some(channel) = self.channels.get_mut(name) {
                channel.value = *value;
            }
        }
    }
}
