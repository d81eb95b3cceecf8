//! Mock device driver.
//!
//! A simulated instrument for development and testing without physical
//! hardware: a set of named channels, realistic per-call latency, and
//! injectable faults (failing transitions, failing init, a sleep operation
//! that wedges the worker). The probe handle gives tests a direct view of
//! the simulated hardware state and the call log, bypassing the engine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use rand::Rng;
use serde::Deserialize;

use crate::config::DeviceDefinition;
use crate::core::{
    ChannelValues, DeviceDriver, Mode, ModeSet, ParameterValue, TimelineRef,
};
use crate::drivers::{DriverRegistry, DriverSpec};
use crate::error::{StationError, StationResult};
use crate::operation::forward_to_worker;
use crate::worker::{WorkerBuilder, WorkerFactory};

/// Mock driver configuration.
///
/// ```toml
/// [devices.config]
/// channels = ["freq", "amp", "phase"]
/// latency = "5ms"
/// run_delta = 1.0
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Simulated hardware channels.
    pub channels: Vec<String>,
    /// Latency applied to every hardware call.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Offset added to each channel over a buffered run, so final values
    /// are distinguishable from initial values.
    pub run_delta: f64,
    /// Fault injection: `transition_to_buffered` fails.
    pub fail_transitions: bool,
    /// Fault injection: `init` fails.
    pub fail_init: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            channels: vec!["ch0".into(), "ch1".into()],
            latency: Duration::from_millis(5),
            run_delta: 1.0,
            fail_transitions: false,
            fail_init: false,
        }
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    values: ChannelValues,
    calls: Vec<String>,
}

/// Shared view of a mock device's state, for tests and demos.
#[derive(Clone, Debug, Default)]
pub struct MockProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulated hardware outputs.
    pub fn values(&self) -> ChannelValues {
        self.state.lock().map(|s| s.values.clone()).unwrap_or_default()
    }

    /// Every driver call so far, in execution order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// How many times `name` was executed against the driver.
    pub fn call_count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == name).count()
    }
}

/// The simulated instrument.
pub struct MockDevice {
    name: String,
    config: MockConfig,
    probe: MockProbe,
    pre_run: Option<ChannelValues>,
    connected: bool,
}

impl MockDevice {
    pub fn new(name: impl Into<String>, config: MockConfig) -> Self {
        Self::attached(name, config, MockProbe::new())
    }

    /// Build a device sharing `probe`; the probe survives worker restarts
    /// when the factory clones it into each replacement device.
    pub fn attached(name: impl Into<String>, config: MockConfig, probe: MockProbe) -> Self {
        Self {
            name: name.into(),
            config,
            probe,
            pre_run: None,
            connected: false,
        }
    }

    fn record(&self, op: &str) {
        if let Ok(mut state) = self.probe.state.lock() {
            state.calls.push(op.to_string());
        }
    }

    fn settle(&self) {
        std::thread::sleep(self.config.latency);
    }

    fn store_values(&self, values: ChannelValues) {
        if let Ok(mut state) = self.probe.state.lock() {
            state.values = values;
        }
    }

    fn current_values(&self) -> ChannelValues {
        self.probe.values()
    }
}

impl DeviceDriver for MockDevice {
    fn init(&mut self) -> Result<()> {
        self.record("init");
        self.settle();
        if self.config.fail_init {
            bail!("mock device '{}' configured to fail init", self.name);
        }
        let zeros: ChannelValues = self
            .config
            .channels
            .iter()
            .map(|name| (name.clone(), 0.0))
            .collect();
        self.store_values(zeros);
        self.connected = true;
        Ok(())
    }

    fn program_manual(&mut self, values: &ChannelValues) -> Result<ChannelValues> {
        self.record("program_manual");
        if !self.connected {
            bail!("mock device '{}' is not connected", self.name);
        }
        self.settle();
        self.store_values(values.clone());
        Ok(self.current_values())
    }

    fn transition_to_buffered(
        &mut self,
        _device_id: &str,
        _timeline: &TimelineRef,
        initial_values: &ChannelValues,
        _fresh: bool,
    ) -> Result<ChannelValues> {
        self.record("transition_to_buffered");
        if !self.connected {
            bail!("mock device '{}' is not connected", self.name);
        }
        if self.config.fail_transitions {
            bail!("injected transition failure on '{}'", self.name);
        }
        self.settle();
        self.pre_run = Some(initial_values.clone());
        let final_values: ChannelValues = initial_values
            .iter()
            .map(|(name, value)| (name.clone(), value + self.config.run_delta))
            .collect();
        // The simulated run completes instantly: the hardware ends up at
        // its final values as soon as it is armed.
        self.store_values(final_values.clone());
        Ok(final_values)
    }

    fn abort_transition_to_buffered(&mut self) -> Result<bool> {
        self.record("abort_transition_to_buffered");
        self.settle();
        if let Some(snapshot) = self.pre_run.take() {
            self.store_values(snapshot);
        }
        Ok(true)
    }

    fn abort_buffered(&mut self) -> Result<bool> {
        self.record("abort_buffered");
        self.settle();
        if let Some(snapshot) = self.pre_run.take() {
            self.store_values(snapshot);
        }
        Ok(true)
    }

    fn transition_to_manual(&mut self, abort: bool) -> Result<bool> {
        self.record("transition_to_manual");
        self.settle();
        match self.pre_run.take() {
            Some(snapshot) if abort => self.store_values(snapshot),
            _ => {} // keep the state reached during the run
        }
        Ok(true)
    }

    fn shutdown(&mut self) -> Result<()> {
        self.record("shutdown");
        self.connected = false;
        Ok(())
    }
}

/// Names of the custom operations every mock worker exposes.
pub const MOCK_OPERATIONS: &[&str] = &["echo", "read_channel", "sleep_ms", "fail", "noise"];

/// Build the worker factory for one mock device. The probe is cloned into
/// every replacement device, so observations survive restarts.
pub fn mock_factory(name: &str, config: MockConfig, probe: MockProbe) -> WorkerFactory {
    let name = name.to_string();
    Arc::new(move |capacity| {
        let device = MockDevice::attached(name.clone(), config.clone(), probe.clone());
        mock_worker(&name, device)
            .expect("mock operation table is statically valid")
            .spawn(capacity)
    })
}

fn mock_worker(name: &str, device: MockDevice) -> StationResult<WorkerBuilder<MockDevice>> {
    WorkerBuilder::new(name, device)
        .operation("echo", |device: &mut MockDevice, args, _kwargs| {
            device.record("echo");
            Ok(args.first().cloned().unwrap_or(ParameterValue::Null))
        })?
        .operation("read_channel", |device: &mut MockDevice, args, _kwargs| {
            device.record("read_channel");
            let channel = args
                .first()
                .and_then(ParameterValue::as_string)
                .ok_or_else(|| anyhow::anyhow!("read_channel expects a channel name"))?;
            let values = device.current_values();
            match values.get(&channel) {
                Some(value) => Ok(ParameterValue::Float(*value)),
                None => bail!("no channel named '{}'", channel),
            }
        })?
        .operation("sleep_ms", |device: &mut MockDevice, args, _kwargs| {
            device.record("sleep_ms");
            let ms = args
                .first()
                .and_then(ParameterValue::as_f64)
                .ok_or_else(|| anyhow::anyhow!("sleep_ms expects a duration"))?;
            std::thread::sleep(Duration::from_millis(ms as u64));
            Ok(ParameterValue::Null)
        })?
        .operation("fail", |device: &mut MockDevice, _args, _kwargs| {
            device.record("fail");
            bail!("injected failure");
        })?
        .operation("noise", |device: &mut MockDevice, _args, _kwargs| {
            device.record("noise");
            Ok(ParameterValue::Float(rand::thread_rng().gen::<f64>()))
        })
}

/// Tab operations bridging to the mock worker's custom table.
pub fn mock_operations() -> Vec<crate::operation::Operation> {
    MOCK_OPERATIONS
        .iter()
        .map(|name| forward_to_worker(*name, ModeSet::only(Mode::Manual)))
        .collect()
}

/// Register the mock driver type.
pub fn register(registry: &mut DriverRegistry) {
    registry.register("mock", |definition: &DeviceDefinition| {
        let config: MockConfig = definition.config.clone().try_into().map_err(|e| {
            StationError::Configuration(format!(
                "invalid mock config for '{}': {}",
                definition.name, e
            ))
        })?;
        Ok(DriverSpec {
            factory: mock_factory(&definition.name, config, MockProbe::new()),
            operations: mock_operations(),
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> MockConfig {
        MockConfig {
            latency: Duration::from_millis(0),
            ..MockConfig::default()
        }
    }

    fn values(pairs: &[(&str, f64)]) -> ChannelValues {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn buffered_round_trip_keeps_final_values() {
        let (probe, mut device) = {
            let probe = MockProbe::new();
            let device = MockDevice::attached("m", quick(), probe.clone());
            (probe, device)
        };
        device.init().unwrap();

        let initial = values(&[("ch0", 1.0), ("ch1", 2.0)]);
        let finals = device
            .transition_to_buffered("m", &TimelineRef::new("/tmp/shot.h5"), &initial, true)
            .unwrap();
        assert_eq!(finals, values(&[("ch0", 2.0), ("ch1", 3.0)]));

        device.transition_to_manual(false).unwrap();
        assert_eq!(probe.values(), finals);
    }

    #[test]
    fn abort_restores_initial_values() {
        let probe = MockProbe::new();
        let mut device = MockDevice::attached("m", quick(), probe.clone());
        device.init().unwrap();

        let initial = values(&[("ch0", 4.5)]);
        device
            .transition_to_buffered("m", &TimelineRef::new("/tmp/shot.h5"), &initial, true)
            .unwrap();
        assert_ne!(probe.values(), initial);

        device.abort_transition_to_buffered().unwrap();
        assert_eq!(probe.values(), initial);
    }

    #[test]
    fn config_parses_from_toml() {
        let value: toml::Value = toml::from_str(
            r#"
            channels = ["freq", "amp"]
            latency = "1ms"
            run_delta = 0.5
            "#,
        )
        .unwrap();
        let config: MockConfig = value.try_into().unwrap();
        assert_eq!(config.channels, vec!["freq", "amp"]);
        assert_eq!(config.latency, Duration::from_millis(1));
        assert_eq!(config.run_delta, 0.5);
        assert!(!config.fail_transitions);
    }
}
