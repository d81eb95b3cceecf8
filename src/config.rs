//! Station configuration.
//!
//! Strongly-typed configuration loading built on Figment. Settings are
//! layered from three sources, later ones winning:
//!
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A TOML file (`labstation.toml` by default)
//! 3. Environment variables prefixed with `LABSTATION_`
//!
//! Durations are human-readable (`"250ms"`, `"5s"`) via `humantime-serde`.
//!
//! # Example
//! ```toml
//! [application]
//! name = "labstation"
//! log_level = "info"
//! log_format = "pretty"
//!
//! [station]
//! queue_capacity = 64
//! restart_queue_policy = "drain"
//!
//! [liveness]
//! poll_interval = "250ms"
//! threshold = "5s"
//!
//! [[devices]]
//! name = "dds_0"
//! type = "mock"
//! [devices.config]
//! channels = ["freq", "amp", "phase"]
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::StationResult;

/// Top-level station configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application-wide settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Engine tunables shared by every tab.
    #[serde(default)]
    pub station: StationConfig,
    /// Liveness monitor tunables.
    #[serde(default)]
    pub liveness: LivenessConfig,
    /// Managed device definitions.
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            station: StationConfig::default(),
            liveness: LivenessConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional TOML file, and environment.
    pub fn load(path: Option<&Path>) -> StationResult<Self> {
        let file = path.unwrap_or_else(|| Path::new("labstation.toml"));
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("LABSTATION_").split("__"))
            .extract()?;
        Ok(settings)
    }
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name, used in log output.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log output format (pretty, compact, json).
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "labstation".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// What happens to a tab's queued requests when its worker is restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// Keep queued requests; they run against the replacement worker.
    Preserve,
    /// Fail queued requests with a restart error.
    Drain,
}

/// Engine tunables shared by every tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Capacity of each tab's request queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Capacity of each worker's request channel. The protocol is strictly
    /// request-then-response, so this stays small.
    #[serde(default = "default_worker_channel_capacity")]
    pub worker_channel_capacity: usize,
    /// Capacity of each tab's broadcast event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Queue disposition on worker restart.
    #[serde(default = "default_queue_policy")]
    pub restart_queue_policy: QueuePolicy,
    /// How long a graceful worker shutdown may take before the thread is
    /// abandoned.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            worker_channel_capacity: default_worker_channel_capacity(),
            event_capacity: default_event_capacity(),
            restart_queue_policy: default_queue_policy(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Liveness monitor tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Sampling interval for the state-age check.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// State age past which a non-idle tab is flagged as not responding.
    /// A design parameter, not a hard deadline: one interval cannot
    /// distinguish "slow but fine" from "hung".
    #[serde(default = "default_threshold", with = "humantime_serde")]
    pub threshold: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            threshold: default_threshold(),
        }
    }
}

/// A managed device, bound to a registered driver type at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique tab name.
    pub name: String,
    /// Driver type looked up in the driver registry (e.g. "mock").
    pub r#type: String,
    /// Whether this device is brought up at startup.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver-specific configuration (free-form).
    #[serde(default = "default_device_config")]
    pub config: toml::Value,
}

fn default_queue_capacity() -> usize {
    64
}

fn default_worker_channel_capacity() -> usize {
    4
}

fn default_event_capacity() -> usize {
    64
}

fn default_queue_policy() -> QueuePolicy {
    QueuePolicy::Drain
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_threshold() -> Duration {
    Duration::from_secs(5)
}

fn default_enabled() -> bool {
    true
}

fn default_device_config() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.station.restart_queue_policy, QueuePolicy::Drain);
        assert!(settings.liveness.poll_interval < settings.liveness.threshold);
        assert!(settings.devices.is_empty());
    }

    #[test]
    fn parses_toml_fragment() {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(
                r#"
                [application]
                log_level = "debug"

                [liveness]
                poll_interval = "100ms"
                threshold = "2s"

                [[devices]]
                name = "dds_0"
                type = "mock"
                "#,
            ))
            .extract()
            .unwrap();

        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.liveness.poll_interval, Duration::from_millis(100));
        assert_eq!(settings.liveness.threshold, Duration::from_secs(2));
        assert_eq!(settings.devices.len(), 1);
        assert_eq!(settings.devices[0].r#type, "mock");
        assert!(settings.devices[0].enabled);
    }
}
