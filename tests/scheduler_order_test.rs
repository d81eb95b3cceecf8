//! Integration tests for scheduler ordering, coalescing and fault handling.

use std::time::Duration;

use labstation::core::{ChannelValues, ParameterValue, WorkValue};
use labstation::drivers::mock::{mock_factory, mock_operations, MockConfig, MockProbe};
use labstation::error::StationError;
use labstation::operation::OpArgs;
use labstation::scheduler::TabEvent;
use labstation::tab::{Tab, TabBuilder};

async fn spawn_tab(config: MockConfig) -> (Tab, MockProbe) {
    let probe = MockProbe::new();
    let factory = mock_factory("dev", config, probe.clone());
    let mut builder = TabBuilder::new("dev", factory);
    for op in mock_operations() {
        builder = builder.operation(op);
    }
    (builder.spawn().await.unwrap(), probe)
}

fn custom(args: Vec<ParameterValue>) -> OpArgs {
    OpArgs::Custom {
        args,
        kwargs: Default::default(),
    }
}

#[tokio::test]
async fn completion_order_equals_submission_order() {
    let (tab, probe) = spawn_tab(MockConfig {
        latency: Duration::from_millis(0),
        ..MockConfig::default()
    })
    .await;
    let handle = tab.handle();

    handle
        .submit("sleep_ms", custom(vec![ParameterValue::Int(40)]))
        .await
        .unwrap();
    handle.submit("echo", custom(vec![])).await.unwrap();
    handle
        .submit("read_channel", custom(vec![ParameterValue::from("ch0")]))
        .await
        .unwrap();
    // The awaited request is the last one in, so everything before it has
    // completed (or aborted) by the time it answers.
    handle
        .request("echo", custom(vec![ParameterValue::Int(7)]))
        .await
        .unwrap();

    let calls = probe.calls();
    assert_eq!(
        calls,
        vec!["init", "sleep_ms", "echo", "read_channel", "echo"]
    );

    tab.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn single_outstanding_requests_execute_once() {
    let (tab, probe) = spawn_tab(MockConfig {
        latency: Duration::from_millis(50),
        ..MockConfig::default()
    })
    .await;
    let handle = tab.handle();

    let values: ChannelValues = [("ch0".to_string(), 1.0)].into_iter().collect();
    let (first, second, third) = tokio::join!(
        handle.request("program_manual", OpArgs::Values(values.clone())),
        handle.request("program_manual", OpArgs::Values(values.clone())),
        handle.request("program_manual", OpArgs::Values(values.clone())),
    );

    // Exactly one request reached the worker; the duplicates were
    // coalesced to a success with no value.
    assert_eq!(probe.call_count("program_manual"), 1);
    let results = [first.unwrap(), second.unwrap(), third.unwrap()];
    let executed = results
        .iter()
        .filter(|r| matches!(r, WorkValue::Channels(_)))
        .count();
    let coalesced = results
        .iter()
        .filter(|r| matches!(r, WorkValue::None))
        .count();
    assert_eq!(executed, 1);
    assert_eq!(coalesced, 2);

    tab.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn worker_failure_leaves_the_tab_schedulable() {
    let (tab, probe) = spawn_tab(MockConfig {
        latency: Duration::from_millis(0),
        ..MockConfig::default()
    })
    .await;
    let handle = tab.handle();

    let err = handle.request("fail", OpArgs::None).await.unwrap_err();
    match err {
        StationError::WorkerExecution { operation, detail } => {
            assert_eq!(operation, "fail");
            assert!(detail.contains("injected failure"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // A subsequent unrelated operation still runs.
    let result = handle
        .request("echo", custom(vec![ParameterValue::Int(3)]))
        .await
        .unwrap();
    assert_eq!(result, WorkValue::Value(ParameterValue::Int(3)));
    assert_eq!(probe.call_count("echo"), 1);

    tab.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn unregistered_operation_is_rejected() {
    let (tab, _probe) = spawn_tab(MockConfig::default()).await;
    let handle = tab.handle();

    let err = handle.request("bogus", OpArgs::None).await.unwrap_err();
    assert!(matches!(err, StationError::UnknownOperation(name) if name == "bogus"));

    tab.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn failures_are_surfaced_on_the_event_channel() {
    let (tab, _probe) = spawn_tab(MockConfig {
        latency: Duration::from_millis(0),
        ..MockConfig::default()
    })
    .await;
    let handle = tab.handle();
    let mut events = handle.subscribe_events();

    let _ = handle.request("fail", OpArgs::None).await;

    let mut saw_failure = false;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(500), events.recv()).await
    {
        if let TabEvent::OperationFailed { operation, error } = event {
            assert_eq!(operation, "fail");
            assert!(error.contains("injected failure"));
            saw_failure = true;
            break;
        }
    }
    assert!(saw_failure);

    tab.shutdown(Duration::from_secs(1)).await;
}
