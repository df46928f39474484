//! Stop reasons, runtime failures and setup failures

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

use harbor_core::application::operation_provider::container_name;
use harbor_core::{EngineConfig, FlowId, FlowStatus, OpStatus, StopReason};
use harbor_integration_tests::{spawn_run, WAIT};
use harbor_test_utils::assertions::{assert_flow_status, assert_op_logs_contain, assert_op_status};
use harbor_test_utils::{
    fast_engine_config, init_test_tracing, wait_for_op_status, ContainerScript,
    JobDefinitionBuilder, OperationBuilder, RuntimeCall, TestEngine,
};

fn services(count: usize) -> harbor_core::JobDefinition {
    (0..count)
        .fold(JobDefinitionBuilder::new(), |builder, i| {
            builder.op(OperationBuilder::run(&format!("svc-{i}"), "service").group("g"))
        })
        .build()
}

async fn stop_running_services(reason: StopReason) -> (TestEngine, harbor_core::Flow) {
    init_test_tracing();
    let engine = TestEngine::new();
    engine
        .runtime
        .script_image("service", ContainerScript::new().until_stopped());
    let flow_id = FlowId::from("services");
    let manager = Arc::new(engine.task_manager("services", services(3)).unwrap());
    manager.init().await.unwrap();

    let run = spawn_run(Arc::clone(&manager));
    for i in 0..3 {
        let op_id = format!("svc-{i}");
        wait_for_op_status(engine.repository.as_ref(), &flow_id, &op_id, OpStatus::Running, WAIT)
            .await
            .unwrap();
    }

    manager.stop(reason).await.unwrap();
    tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();

    let flow = engine.flow("services").await.unwrap();
    (engine, flow)
}

#[tokio::test]
async fn test_stop_settles_every_running_operation_as_stopped() {
    let (engine, flow) = stop_running_services(StopReason::Stopped).await;

    assert_flow_status(&flow, FlowStatus::Stopped).unwrap();
    assert!(flow.state.end_time.is_some());
    for state in &flow.state.op_states {
        assert_eq!(state.status, OpStatus::Stopped, "{}", state.operation_id);
        assert!(state.end_time.is_some());
    }
    assert!(engine.runtime.existing_containers().is_empty());
    assert!(engine.runtime.networks().is_empty());
}

#[tokio::test]
async fn test_expired_job_counts_as_success() {
    let (_engine, flow) = stop_running_services(StopReason::Expired).await;

    assert_flow_status(&flow, FlowStatus::Success).unwrap();
    assert!(flow
        .state
        .op_states
        .iter()
        .all(|state| state.status == OpStatus::Success));
}

#[tokio::test]
async fn test_quit_fails_flow_and_operations() {
    let (_engine, flow) = stop_running_services(StopReason::Quit).await;

    assert_flow_status(&flow, FlowStatus::Failed).unwrap();
    assert!(flow
        .state
        .op_states
        .iter()
        .all(|state| state.status == OpStatus::Failed));
}

#[tokio::test]
async fn test_stop_before_run_never_touches_containers() {
    init_test_tracing();
    let engine = TestEngine::new();
    let definition = JobDefinitionBuilder::new()
        .op(OperationBuilder::run("a", "ubuntu").cmd("echo a"))
        .op(OperationBuilder::run("b", "ubuntu").cmd("echo b"))
        .build();
    let manager = engine.task_manager("early", definition).unwrap();
    manager.init().await.unwrap();

    manager.stop(StopReason::Stopped).await.unwrap();
    manager.run().await.unwrap();

    let flow = engine.flow("early").await.unwrap();
    assert_flow_status(&flow, FlowStatus::Stopped).unwrap();
    assert_op_status(&flow, "a", OpStatus::Stopped).unwrap();
    assert_op_status(&flow, "b", OpStatus::Stopped).unwrap();
    assert!(flow.op_state("a").unwrap().start_time.is_none());
    assert!(!engine.runtime.calls().iter().any(|call| matches!(
        call,
        RuntimeCall::PullImage(_) | RuntimeCall::RunContainer { .. }
    )));
}

#[tokio::test]
async fn test_pull_failure_fails_operation_with_exit_code_two() {
    init_test_tracing();
    let engine = TestEngine::new();
    engine.runtime.fail_pull("private/image", "manifest unknown");
    let definition = JobDefinitionBuilder::new()
        .op(OperationBuilder::run("a", "private/image"))
        .op(OperationBuilder::run("b", "ubuntu").cmd("echo still running"))
        .build();

    let flow = engine.run_to_end("pull", definition).await.unwrap();

    let a = flow.op_state("a").unwrap();
    assert_eq!(a.status, OpStatus::Failed);
    assert_eq!(a.exit_code, Some(2));
    assert!(a.end_time.is_some());
    assert_op_logs_contain(&flow, "a", "manifest unknown").unwrap();
    assert_op_status(&flow, "b", OpStatus::Success).unwrap();
}

#[tokio::test]
async fn test_launch_failure_fails_operation() {
    init_test_tracing();
    let engine = TestEngine::new();
    let flow_id = FlowId::from("launch");
    engine.runtime.script_container(
        &container_name(&flow_id, "a"),
        ContainerScript::new().fail_run("no space left on device"),
    );
    let definition = JobDefinitionBuilder::new()
        .op(OperationBuilder::run("a", "ubuntu"))
        .build();

    let flow = engine.run_to_end("launch", definition).await.unwrap();

    let a = flow.op_state("a").unwrap();
    assert_eq!((a.status, a.exit_code), (OpStatus::Failed, Some(2)));
    assert_op_logs_contain(&flow, "a", "no space left on device").unwrap();
}

#[tokio::test]
async fn test_non_zero_exit_fails_operation() {
    init_test_tracing();
    let engine = TestEngine::new();
    engine
        .runtime
        .script_image("broken", ContainerScript::new().stderr("boom").exit_code(3));
    let definition = JobDefinitionBuilder::new()
        .op(OperationBuilder::run("a", "broken"))
        .build();

    let flow = engine.run_to_end("exit", definition).await.unwrap();

    let a = flow.op_state("a").unwrap();
    assert_eq!((a.status, a.exit_code), (OpStatus::Failed, Some(3)));
    assert_op_logs_contain(&flow, "a", "boom").unwrap();
}

#[tokio::test]
async fn test_interpolation_failure_fails_only_that_operation() {
    init_test_tracing();
    let engine = TestEngine::new();
    let flow_id = FlowId::from("interp");
    let definition = JobDefinitionBuilder::new()
        .op(OperationBuilder::run("a", "ubuntu").cmd("echo a"))
        .op(OperationBuilder::run("b", "ubuntu").cmd("echo %%ops.a.results.token%%"))
        .op(OperationBuilder::run("c", "ubuntu").cmd("echo c"))
        .build();

    let flow = engine.run_to_end("interp", definition).await.unwrap();

    let b = flow.op_state("b").unwrap();
    assert_eq!((b.status, b.exit_code), (OpStatus::Failed, Some(0)));
    assert!(b.start_time.is_some());
    assert_eq!(b.start_time, b.end_time);
    assert_op_logs_contain(&flow, "b", "Setup failed").unwrap();
    assert_op_status(&flow, "a", OpStatus::Success).unwrap();
    assert_op_status(&flow, "c", OpStatus::Success).unwrap();

    let b_container = container_name(&flow_id, "b");
    assert!(!engine.runtime.calls().iter().any(|call| matches!(
        call,
        RuntimeCall::RunContainer { name, .. } if *name == b_container
    )));
}

#[tokio::test]
async fn test_startup_health_timeout_fails_and_removes_container() {
    init_test_tracing();
    let engine = TestEngine::with_config(EngineConfig {
        startup_timeout: Duration::from_millis(150),
        ..fast_engine_config()
    });
    engine
        .runtime
        .script_image("silent", ContainerScript::new().until_stopped());
    let definition = JobDefinitionBuilder::new()
        .op(OperationBuilder::run("a", "silent").log_health_check("listening"))
        .build();

    let flow = engine.run_to_end("health", definition).await.unwrap();

    let a = flow.op_state("a").unwrap();
    assert_eq!((a.status, a.exit_code), (OpStatus::Failed, Some(2)));
    assert_op_logs_contain(&flow, "a", "Startup health checks timed out").unwrap();
    assert!(engine.runtime.existing_containers().is_empty());
}
