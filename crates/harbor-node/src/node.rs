//! Node orchestration: one job definition, run to completion

use std::future::pending;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use harbor_core::{
    ContainerRuntime, EngineConfig, Flow, FlowRepository, JobDefinition, OperationProvider,
    OperationType, ResourceCache, StopReason, TaskManager,
};
use harbor_runtime_docker::DockerCliRuntime;
use harbor_state_file::JsonFileFlowRepository;

use crate::background::{spawn_cache_resync, spawn_flow_retention};
use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// A compute node running a single flow
pub struct Node {
    config: NodeConfig,
    repository: Arc<dyn FlowRepository>,
    runtime: Arc<dyn ContainerRuntime>,
    cache: Arc<ResourceCache>,
    provider: Arc<OperationProvider>,
}

impl Node {
    /// Node backed by the on-disk flow store and the Docker CLI
    pub async fn new(config: NodeConfig) -> NodeResult<Self> {
        let repository = JsonFileFlowRepository::open(&config.state_dir).await?;
        let runtime = DockerCliRuntime::new(config.docker_bin.clone());
        Ok(Self::with_parts(
            config,
            Arc::new(repository),
            Arc::new(runtime),
            EngineConfig::default(),
        ))
    }

    /// Node over explicit adapters
    pub fn with_parts(
        config: NodeConfig,
        repository: Arc<dyn FlowRepository>,
        runtime: Arc<dyn ContainerRuntime>,
        engine: EngineConfig,
    ) -> Self {
        let cache = Arc::new(ResourceCache::default());
        let provider = Arc::new(OperationProvider::new(
            Arc::clone(&runtime),
            Arc::clone(&cache),
            engine,
        ));

        Self {
            config,
            repository,
            runtime,
            cache,
            provider,
        }
    }

    /// Repository the node persists flows into
    pub fn repository(&self) -> &Arc<dyn FlowRepository> {
        &self.repository
    }

    /// Run the configured job until it finishes
    ///
    /// `shutdown` stops the flow with `quit`; the configured job timeout
    /// stops it with `expired`. Returns the final flow.
    pub async fn run(&self, shutdown: CancellationToken) -> NodeResult<Flow> {
        if !self.runtime.healthy().await.unwrap_or(false) {
            return Err(NodeError::RuntimeUnavailable(self.config.docker_bin.clone()));
        }

        let definition = load_job_definition(&self.config.job_file).await?;
        let flow_id = self.config.flow_id();

        let background = CancellationToken::new();
        let tasks = [
            spawn_cache_resync(
                Arc::clone(&self.cache),
                Arc::clone(&self.runtime),
                self.config.cache_resync_interval(),
                background.clone(),
            ),
            spawn_flow_retention(
                Arc::clone(&self.repository),
                self.config.flow_retention(),
                RETENTION_SWEEP_INTERVAL,
                background.clone(),
            ),
        ];

        let outcome = self.run_flow(&flow_id, definition, &shutdown).await;

        background.cancel();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Background task ended abnormally");
            }
        }

        outcome
    }

    async fn run_flow(
        &self,
        flow_id: &harbor_core::FlowId,
        definition: JobDefinition,
        shutdown: &CancellationToken,
    ) -> NodeResult<Flow> {
        for image in required_images(&definition) {
            self.cache.mark_image_required(&image);
        }

        let manager = match TaskManager::new(
            flow_id.clone(),
            definition.clone(),
            Arc::clone(&self.repository),
            Arc::clone(&self.provider),
        ) {
            Ok(manager) => manager,
            Err(plan_error) => {
                let flow = TaskManager::reject(
                    self.repository.as_ref(),
                    flow_id.clone(),
                    definition,
                    &plan_error,
                )
                .await?;
                return Ok(flow);
            }
        };

        manager.init().await?;

        let run = manager.run();
        tokio::pin!(run);
        let expiry = async {
            match self.config.job_timeout() {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => pending::<()>().await,
            }
        };
        tokio::pin!(expiry);

        let mut stopping = false;
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = shutdown.cancelled(), if !stopping => {
                    stopping = true;
                    if let Err(err) = manager.stop(StopReason::Quit).await {
                        error!(flow_id = %flow_id, error = %err, "Failed to record quit");
                    }
                }
                _ = &mut expiry, if !stopping => {
                    stopping = true;
                    info!(flow_id = %flow_id, "Job timeout reached");
                    if let Err(err) = manager.stop(StopReason::Expired).await {
                        error!(flow_id = %flow_id, error = %err, "Failed to record expiry");
                    }
                }
            }
        };
        result?;

        let flow = self
            .repository
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| harbor_core::CoreError::FlowNotFound(flow_id.to_string()))?;
        Ok(flow)
    }
}

/// Read and parse a job definition file
pub async fn load_job_definition(path: &Path) -> NodeResult<JobDefinition> {
    let job_file_error = |message: String| NodeError::JobFile {
        path: path.display().to_string(),
        message,
    };

    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| job_file_error(err.to_string()))?;
    JobDefinition::from_json(&json).map_err(|err| job_file_error(err.to_string()))
}

// Images named literally by the definition; interpolated ones are skipped.
fn required_images(definition: &JobDefinition) -> Vec<String> {
    let global = definition
        .global
        .as_ref()
        .and_then(|global| global.image.clone());

    let mut images: Vec<String> = definition
        .ops
        .iter()
        .filter(|op| op.op_type == OperationType::ContainerRun)
        .filter_map(|op| {
            op.args
                .get("image")
                .and_then(|image| image.as_str())
                .map(str::to_string)
                .or_else(|| global.clone())
        })
        .filter(|image| !image.contains("%%"))
        .collect();
    images.sort();
    images.dedup();
    images
}
