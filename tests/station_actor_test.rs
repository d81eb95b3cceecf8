//! Integration tests for the supervisory station actor.

use std::sync::Arc;
use std::time::Duration;

use labstation::config::{DeviceDefinition, Settings};
use labstation::core::{ChannelValues, Mode, WorkValue};
use labstation::drivers::DriverRegistry;
use labstation::error::StationError;
use labstation::messages::StationCommand;
use labstation::operation::OpArgs;
use labstation::station::Station;
use tokio::sync::mpsc;

fn mock_device(name: &str) -> DeviceDefinition {
    DeviceDefinition {
        name: name.into(),
        r#type: "mock".into(),
        enabled: true,
        config: toml::Value::Table(toml::map::Map::new()),
    }
}

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.devices = vec![mock_device("dds_0"), mock_device("shutter_0")];
    settings.station.shutdown_timeout = Duration::from_secs(1);
    settings
}

async fn spawn_station() -> (mpsc::Sender<StationCommand>, tokio::task::JoinHandle<()>) {
    let registry = Arc::new(DriverRegistry::with_builtin());
    let station = Station::new(test_settings(), registry);
    let (command_tx, command_rx) = mpsc::channel(32);
    let task = tokio::spawn(station.run(command_rx));
    (command_tx, task)
}

#[tokio::test]
async fn configured_devices_come_up_as_tabs() {
    let (command_tx, task) = spawn_station().await;

    let (cmd, rx) = StationCommand::list_tabs();
    command_tx.send(cmd).await.unwrap();
    let tabs = rx.await.unwrap();
    assert_eq!(tabs, vec!["dds_0".to_string(), "shutter_0".to_string()]);

    let (cmd, rx) = StationCommand::shutdown();
    command_tx.send(cmd).await.unwrap();
    rx.await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn requests_route_to_the_right_tab() {
    let (command_tx, task) = spawn_station().await;

    let values: ChannelValues = [("ch0".to_string(), 2.5)].into_iter().collect();
    let (cmd, rx) = StationCommand::request("dds_0", "program_manual", OpArgs::Values(values));
    command_tx.send(cmd).await.unwrap();
    let result = rx.await.unwrap().unwrap();
    match result {
        WorkValue::Channels(channels) => assert_eq!(channels["ch0"], 2.5),
        other => panic!("unexpected result: {other:?}"),
    }

    let (cmd, rx) = StationCommand::request("no_such_tab", "program_manual", OpArgs::None);
    command_tx.send(cmd).await.unwrap();
    let err = rx.await.unwrap().unwrap_err();
    assert!(matches!(err, StationError::UnknownTab(tab) if tab == "no_such_tab"));

    let (cmd, rx) = StationCommand::shutdown();
    command_tx.send(cmd).await.unwrap();
    rx.await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn health_covers_every_tab() {
    let (command_tx, task) = spawn_station().await;

    let (cmd, rx) = StationCommand::health();
    command_tx.send(cmd).await.unwrap();
    let health = rx.await.unwrap();
    assert_eq!(health.tabs.len(), 2);
    for (name, report) in &health.tabs {
        assert_eq!(report.mode, Mode::Manual, "tab {name} should start manual");
        assert!(report.responding);
    }

    let (cmd, rx) = StationCommand::tab_health("dds_0");
    command_tx.send(cmd).await.unwrap();
    assert!(rx.await.unwrap().is_ok());

    let (cmd, rx) = StationCommand::tab_health("nope");
    command_tx.send(cmd).await.unwrap();
    assert!(matches!(
        rx.await.unwrap(),
        Err(StationError::UnknownTab(_))
    ));

    let (cmd, rx) = StationCommand::shutdown();
    command_tx.send(cmd).await.unwrap();
    rx.await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn duplicate_tab_names_are_rejected() {
    let (command_tx, task) = spawn_station().await;

    let (cmd, rx) = StationCommand::create_tab(mock_device("dds_0"));
    command_tx.send(cmd).await.unwrap();
    let err = rx.await.unwrap().unwrap_err();
    assert!(matches!(err, StationError::TabExists(name) if name == "dds_0"));

    let (cmd, rx) = StationCommand::shutdown();
    command_tx.send(cmd).await.unwrap();
    rx.await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn restart_through_the_station_resets_the_tab() {
    let (command_tx, task) = spawn_station().await;

    let (cmd, rx) = StationCommand::restart_tab("dds_0");
    command_tx.send(cmd).await.unwrap();
    rx.await.unwrap().unwrap();

    let (cmd, rx) = StationCommand::tab_health("dds_0");
    command_tx.send(cmd).await.unwrap();
    let report = rx.await.unwrap().unwrap();
    assert_eq!(report.mode, Mode::Manual);
    assert!(report.responding);

    let (cmd, rx) = StationCommand::shutdown();
    command_tx.send(cmd).await.unwrap();
    rx.await.unwrap();
    task.await.unwrap();
}
