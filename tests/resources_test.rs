//! Networks, volumes and the resource cache

use chrono::{Duration, Utc};
use mockall::predicate::eq;
use pretty_assertions::assert_eq;

use harbor_core::application::operation_provider::{flow_network_name, volume_name};
use harbor_core::{FlowId, OpStatus, ResourceCache};
use harbor_test_utils::assertions::assert_op_status;
use harbor_test_utils::mocks::create_mock_container_runtime;
use harbor_test_utils::{
    init_test_tracing, JobDefinitionBuilder, MockContainerRuntime, OperationBuilder, RuntimeCall,
    TestEngine,
};

#[tokio::test]
async fn test_flow_volume_is_created_mounted_and_torn_down() {
    init_test_tracing();
    let engine = TestEngine::new();
    let flow_id = FlowId::from("vol");
    let definition = JobDefinitionBuilder::new()
        .op(OperationBuilder::volume("data", "data"))
        .op(
            OperationBuilder::run("writer", "ubuntu")
                .cmd("echo written")
                .mount("data", "/data"),
        )
        .build();

    let flow = engine.run_to_end("vol", definition).await.unwrap();

    let volume = volume_name(&flow_id, "data");
    assert_op_status(&flow, "data", OpStatus::Success).unwrap();
    assert_op_status(&flow, "writer", OpStatus::Success).unwrap();
    assert_eq!(
        flow.op_state("data").unwrap().provider_id.as_deref(),
        Some(volume.as_str())
    );

    let calls = engine.runtime.calls();
    assert!(calls.contains(&RuntimeCall::CreateVolume(Some(volume.clone()))));
    assert!(calls.contains(&RuntimeCall::DeleteVolume(volume.clone())));
    assert!(engine.runtime.volumes().is_empty());
    assert_eq!(engine.cache.volume_usage(&volume).unwrap().usage_count, 1);
    assert_eq!(engine.cache.image_usage("ubuntu").unwrap().usage_count, 1);
}

#[tokio::test]
async fn test_flow_network_wraps_every_runtime_call() {
    init_test_tracing();
    let engine = TestEngine::new();
    let flow_id = FlowId::from("net");
    let definition = JobDefinitionBuilder::new()
        .op(OperationBuilder::run("a", "ubuntu").cmd("echo a"))
        .build();

    engine.run_to_end("net", definition).await.unwrap();

    let calls = engine.runtime.calls();
    let network = flow_network_name(&flow_id);
    assert_eq!(calls.first(), Some(&RuntimeCall::CreateNetwork(network.clone())));
    assert_eq!(calls.last(), Some(&RuntimeCall::DeleteNetwork(network)));
    assert!(engine.runtime.existing_containers().is_empty());
}

#[tokio::test]
async fn test_resync_evicts_stale_and_drops_missing_resources() {
    let cache = ResourceCache::new(Duration::hours(24));
    cache.set_image_used("old:1");
    cache.set_image_used("fresh:2");
    cache.mark_image_required("pinned");
    cache.set_volume_used("gone");

    let mut runtime = MockContainerRuntime::new();
    runtime.expect_list_images().returning(|| {
        Ok(vec![
            "old:1".to_string(),
            "pinned:latest".to_string(),
            "unknown:9".to_string(),
        ])
    });
    runtime.expect_list_volumes().returning(|| Ok(Vec::new()));
    runtime
        .expect_delete_image()
        .with(eq("old:1"))
        .times(1)
        .returning(|_| Ok(()));

    let later = Utc::now() + Duration::hours(25);
    let report = cache.resync_at(&runtime, later).await.unwrap();

    assert_eq!(report.evicted, vec!["old:1".to_string()]);
    let mut dropped = report.dropped.clone();
    dropped.sort();
    assert_eq!(dropped, vec!["fresh:2".to_string(), "gone".to_string()]);
    assert!(cache.image_usage("old:1").is_none());
    assert!(cache.image_usage("pinned").unwrap().required);
}

#[tokio::test]
async fn test_resync_drops_entries_the_runtime_lost() {
    let cache = ResourceCache::default();
    cache.set_image_used("ubuntu");
    let runtime = create_mock_container_runtime();

    // The default mock lists nothing, so the entry is dropped but never deleted
    let report = cache.resync(&runtime).await.unwrap();

    assert_eq!(report.dropped, vec!["ubuntu:latest".to_string()]);
    assert!(report.evicted.is_empty());
}
