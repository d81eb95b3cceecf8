//! Integration tests for liveness monitoring and worker restart.

use std::time::Duration;

use labstation::config::{LivenessConfig, QueuePolicy, StationConfig};
use labstation::core::{Mode, ParameterValue, WorkValue};
use labstation::drivers::mock::{mock_factory, mock_operations, MockConfig, MockProbe};
use labstation::error::StationError;
use labstation::operation::OpArgs;
use labstation::tab::{Tab, TabBuilder};

const FAST_LIVENESS: LivenessConfig = LivenessConfig {
    poll_interval: Duration::from_millis(20),
    threshold: Duration::from_millis(100),
};

async fn spawn_tab(station: StationConfig) -> (Tab, MockProbe) {
    let probe = MockProbe::new();
    let config = MockConfig {
        latency: Duration::from_millis(0),
        ..MockConfig::default()
    };
    let factory = mock_factory("dev", config, probe.clone());
    let mut builder = TabBuilder::new("dev", factory)
        .station_config(station)
        .liveness_config(FAST_LIVENESS);
    for op in mock_operations() {
        builder = builder.operation(op);
    }
    (builder.spawn().await.unwrap(), probe)
}

fn sleep_args(ms: i64) -> OpArgs {
    OpArgs::Custom {
        args: vec![ParameterValue::Int(ms)],
        kwargs: Default::default(),
    }
}

#[tokio::test]
async fn stuck_worker_is_flagged_and_restart_recovers() {
    let (tab, probe) = spawn_tab(StationConfig::default()).await;
    let handle = tab.handle();

    // Wedge the worker well past the liveness threshold.
    handle.submit("sleep_ms", sleep_args(600)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let health = handle.health();
    assert!(health.busy);
    assert!(!health.responding, "stalled tab must be flagged");
    assert!(matches!(
        handle.ensure_responding(),
        Err(StationError::WorkerUnresponsive { .. })
    ));

    // Restart tears the hung worker down and brings up a fresh one.
    handle.restart().await.unwrap();
    let health = handle.health();
    assert_eq!(health.mode, Mode::Manual);
    assert!(health.responding, "flag clears after a successful restart");
    assert_eq!(probe.call_count("init"), 2);

    // The replacement worker serves requests.
    let result = handle
        .request(
            "echo",
            OpArgs::Custom {
                args: vec![ParameterValue::from("alive")],
                kwargs: Default::default(),
            },
        )
        .await
        .unwrap();
    assert_eq!(result, WorkValue::Value(ParameterValue::from("alive")));

    tab.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn idle_tab_is_never_flagged() {
    let (tab, _probe) = spawn_tab(StationConfig::default()).await;
    let handle = tab.handle();

    // Well past the threshold with nothing running.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let health = handle.health();
    assert_eq!(health.mode, Mode::Manual);
    assert!(health.responding);

    tab.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn restart_fails_pending_requests_under_drain_policy() {
    let (tab, _probe) = spawn_tab(StationConfig {
        restart_queue_policy: QueuePolicy::Drain,
        ..StationConfig::default()
    })
    .await;
    let handle = tab.handle();

    handle.submit("sleep_ms", sleep_args(600)).await.unwrap();
    let pending: Vec<_> = (0..2)
        .map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .request("echo", OpArgs::Custom {
                        args: vec![],
                        kwargs: Default::default(),
                    })
                    .await
            })
        })
        .collect();
    // Give the scheduler time to park the pending requests behind the
    // wedged operation.
    tokio::time::sleep(Duration::from_millis(100)).await;

    handle.restart().await.unwrap();

    for task in pending {
        let result = task.await.unwrap();
        assert!(matches!(result, Err(StationError::Restarted)));
    }

    tab.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn restart_preserves_queue_under_preserve_policy() {
    let (tab, probe) = spawn_tab(StationConfig {
        restart_queue_policy: QueuePolicy::Preserve,
        ..StationConfig::default()
    })
    .await;
    let handle = tab.handle();

    handle.submit("sleep_ms", sleep_args(600)).await.unwrap();
    let pending = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .request("echo", OpArgs::Custom {
                    args: vec![ParameterValue::Int(9)],
                    kwargs: Default::default(),
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    handle.restart().await.unwrap();

    // The preserved request runs against the replacement worker.
    let result = pending.await.unwrap().unwrap();
    assert_eq!(result, WorkValue::Value(ParameterValue::Int(9)));
    assert_eq!(probe.call_count("init"), 2);

    tab.shutdown(Duration::from_secs(1)).await;
}
