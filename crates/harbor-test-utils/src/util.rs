//! Utility functions and a ready-made engine for tests.

use std::sync::Arc;
use std::time::Duration;

use harbor_core::{
    CoreError, EngineConfig, Flow, FlowId, FlowRepository, JobDefinition, OpStatus,
    OperationProvider, PlanError, ResourceCache, TaskManager,
};
use harbor_state_inmemory::InMemoryFlowRepository;

use crate::implementations::FakeContainerRuntime;

/// Install a test-friendly tracing subscriber, honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine tunables shortened for tests
pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        health_check_interval: Duration::from_millis(20),
        startup_timeout: Duration::from_secs(2),
        probe_timeout: Duration::from_millis(200),
        log_drain_timeout: Duration::from_millis(200),
        ..EngineConfig::default()
    }
}

/// Poll the repository until an operation reaches a status.
///
/// Returns the flow snapshot that matched, or `None` once `timeout` elapsed.
pub async fn wait_for_op_status(
    repository: &dyn FlowRepository,
    flow_id: &FlowId,
    op_id: &str,
    status: OpStatus,
    timeout: Duration,
) -> Option<Flow> {
    let poll = async {
        loop {
            if let Ok(Some(flow)) = repository.get_flow(flow_id).await {
                if flow
                    .op_state(op_id)
                    .map(|state| state.status == status)
                    .unwrap_or(false)
                {
                    return flow;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };

    tokio::time::timeout(timeout, poll).await.ok()
}

/// In-memory repository, fake runtime and provider wired together
pub struct TestEngine {
    pub repository: Arc<InMemoryFlowRepository>,
    pub runtime: FakeContainerRuntime,
    pub cache: Arc<ResourceCache>,
    pub provider: Arc<OperationProvider>,
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEngine {
    /// Engine with shortened timings
    pub fn new() -> Self {
        Self::with_config(fast_engine_config())
    }

    /// Engine with explicit tunables
    pub fn with_config(config: EngineConfig) -> Self {
        let runtime = FakeContainerRuntime::new();
        let cache = Arc::new(ResourceCache::default());
        let provider = Arc::new(OperationProvider::new(
            Arc::new(runtime.clone()),
            Arc::clone(&cache),
            config,
        ));

        Self {
            repository: Arc::new(InMemoryFlowRepository::new()),
            runtime,
            cache,
            provider,
        }
    }

    /// Task manager for a flow, backed by this engine
    pub fn task_manager(
        &self,
        flow_id: &str,
        definition: JobDefinition,
    ) -> Result<TaskManager, PlanError> {
        TaskManager::new(
            FlowId::from(flow_id),
            definition,
            self.repository.clone(),
            Arc::clone(&self.provider),
        )
    }

    /// Current snapshot of a flow
    pub async fn flow(&self, flow_id: &str) -> Result<Flow, CoreError> {
        self.repository
            .get_flow(&FlowId::from(flow_id))
            .await?
            .ok_or_else(|| CoreError::FlowNotFound(flow_id.to_string()))
    }

    /// Initialize and run a flow to its end, returning the final snapshot
    pub async fn run_to_end(
        &self,
        flow_id: &str,
        definition: JobDefinition,
    ) -> Result<Flow, CoreError> {
        let manager = self.task_manager(flow_id, definition)?;
        manager.init().await?;
        manager.run().await?;
        self.flow(flow_id).await
    }
}
