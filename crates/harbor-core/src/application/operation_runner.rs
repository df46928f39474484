//! Operation runner
//!
//! Drives the lifecycle of a single operation: setup, pre-flight abort check,
//! execution through the provider, persistence of every state change, readiness
//! signalling and cleanup. The returned future settles only once the operation
//! and its cleanup are done.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::abort::AbortSignal;
use super::operation_provider::{
    OperationEvent, OperationProvider, PreparedOperation, ProviderContext,
};
use crate::domain::flow::{
    Endpoint, EndpointStatus, FlowId, OpStatePatch, OpStatus, StopReason,
};
use crate::domain::interpolation::InterpolationStore;
use crate::domain::job_definition::Operation;
use crate::domain::repository::FlowRepository;
use crate::domain::results::extract_results;
use crate::types::{LogEntry, LogType};
use crate::CoreError;

/// Emitted when an operation passed its startup health checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadySignal {
    /// Operation that became ready
    pub op_id: String,
    /// Operations waiting on its readiness
    pub dependents: Vec<String>,
}

/// Everything a runner needs to execute one operation
#[derive(Debug, Clone)]
pub struct OperationTask {
    /// Flow the operation belongs to
    pub flow_id: FlowId,
    /// Position of the operation in the job definition
    pub index: usize,
    /// The operation
    pub operation: Operation,
    /// Operations unlocked by this one's readiness
    pub dependents: Vec<String>,
    /// Per-operation abort signal
    pub signal: AbortSignal,
    /// Where readiness is reported
    pub ready: mpsc::UnboundedSender<ReadySignal>,
}

/// Executes operations and persists their state
pub struct OperationRunner {
    repository: Arc<dyn FlowRepository>,
    provider: Arc<OperationProvider>,
}

impl OperationRunner {
    /// Create a new runner
    pub fn new(repository: Arc<dyn FlowRepository>, provider: Arc<OperationProvider>) -> Self {
        Self {
            repository,
            provider,
        }
    }

    /// Run one operation to completion
    pub async fn run(&self, task: OperationTask) -> Result<(), CoreError> {
        let flow = self
            .repository
            .get_flow(&task.flow_id)
            .await?
            .ok_or_else(|| CoreError::FlowNotFound(task.flow_id.to_string()))?;

        let store = InterpolationStore::from_flow(&flow);
        let prepared = match PreparedOperation::prepare(
            &task.operation,
            flow.job_definition.global.as_ref(),
            &store,
        ) {
            Ok(prepared) => prepared,
            Err(err) => return self.fail_setup(&task, err).await,
        };

        if let Some(reason) = task.signal.reason() {
            return self.settle_aborted(&task, reason).await;
        }

        let ctx = ProviderContext {
            flow_id: task.flow_id.clone(),
            op_id: task.operation.id.clone(),
            signal: task.signal.clone(),
        };
        let (events, receiver) = mpsc::channel(self.provider.config().event_buffer.max(1));

        let producer = {
            let ctx = &ctx;
            let operation = prepared.clone();
            let provider = &self.provider;
            async move { provider.execute(ctx, operation, &events).await }
        };
        let consumer = self.consume(&task, &prepared, receiver);
        let ((), outcome) = tokio::join!(producer, consumer);

        self.provider
            .cleanup(&ctx, &prepared, outcome.provider_id.as_deref())
            .await;

        match outcome.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn consume(
        &self,
        task: &OperationTask,
        prepared: &PreparedOperation,
        mut receiver: mpsc::Receiver<OperationEvent>,
    ) -> ConsumeOutcome {
        let mut outcome = ConsumeOutcome::default();
        let mut logs: Vec<LogEntry> = Vec::new();
        let mut host: Option<String> = None;

        while let Some(event) = receiver.recv().await {
            let result = match event {
                OperationEvent::Start => {
                    debug!(flow_id = %task.flow_id, op_id = %task.operation.id, "Operation started");
                    self.update(task, OpStatePatch::started(Utc::now())).await
                }
                OperationEvent::Log(entry) => {
                    logs.push(entry.clone());
                    self.log(task, entry).await
                }
                OperationEvent::UpdateOpState(patch) => {
                    if let Some(provider_id) = &patch.provider_id {
                        outcome.provider_id = Some(provider_id.clone());
                    }
                    if let Some(new_host) = &patch.host {
                        host = Some(new_host.clone());
                    }
                    self.update(task, patch).await
                }
                OperationEvent::StartupHealthy => {
                    self.on_ready(task, prepared, host.as_deref()).await
                }
                OperationEvent::ContinuousUnhealthy => {
                    warn!(flow_id = %task.flow_id, op_id = %task.operation.id, "Continuous health check failed");
                    match prepared.exposed_port() {
                        Some(_) => self
                            .repository
                            .update_endpoint(&task.flow_id, &task.operation.id, EndpointStatus::Offline)
                            .await
                            .map(|_| ()),
                        None => Ok(()),
                    }
                }
                OperationEvent::Exit(code) => {
                    let status = match task.signal.reason() {
                        Some(reason) => reason.op_status(),
                        None if code == 0 => OpStatus::Success,
                        None => OpStatus::Failed,
                    };
                    self.finish(task, status, Some(code), &logs).await
                }
                OperationEvent::Error(message) => {
                    let (status, exit_code) = match task.signal.reason() {
                        Some(reason) => (reason.op_status(), None),
                        None => (OpStatus::Failed, Some(2)),
                    };
                    warn!(flow_id = %task.flow_id, op_id = %task.operation.id, error = %message, "Operation failed");
                    let logged = self.log(task, LogEntry::container(message)).await;
                    let finished = self.finish(task, status, exit_code, &logs).await;
                    logged.and(finished)
                }
                OperationEvent::End => break,
            };

            if let Err(err) = result {
                error!(flow_id = %task.flow_id, op_id = %task.operation.id, error = %err, "Failed to persist operation state");
                // Stop the container; the state can no longer be tracked.
                task.signal.abort(StopReason::Unknown);
                outcome.error.get_or_insert(err);
            }
        }

        outcome
    }

    async fn update(&self, task: &OperationTask, patch: OpStatePatch) -> Result<(), CoreError> {
        self.repository
            .update_op_state(&task.flow_id, task.index, patch)
            .await
            .map(|_| ())
    }

    async fn log(&self, task: &OperationTask, entry: LogEntry) -> Result<(), CoreError> {
        match entry.log_type {
            LogType::Info => {
                info!(flow_id = %task.flow_id, op_id = %task.operation.id, "{}", entry.log);
                Ok(())
            }
            LogType::Error => {
                error!(flow_id = %task.flow_id, op_id = %task.operation.id, "{}", entry.log);
                Ok(())
            }
            _ => self
                .repository
                .update_op_state_logs(&task.flow_id, task.index, entry)
                .await
                .map(|_| ()),
        }
    }

    async fn on_ready(
        &self,
        task: &OperationTask,
        prepared: &PreparedOperation,
        host: Option<&str>,
    ) -> Result<(), CoreError> {
        debug!(flow_id = %task.flow_id, op_id = %task.operation.id, "Operation ready");

        if !task.dependents.is_empty() {
            // The scheduler is gone once the flow is over; nothing left to unlock.
            let _ = task.ready.send(ReadySignal {
                op_id: task.operation.id.clone(),
                dependents: task.dependents.clone(),
            });
        }

        match (prepared.exposed_port(), host) {
            (Some(port), Some(host)) => self
                .repository
                .set_endpoint(
                    &task.flow_id,
                    Endpoint {
                        op_id: task.operation.id.clone(),
                        url: format!("http://{host}:{port}"),
                        status: EndpointStatus::Online,
                    },
                )
                .await
                .map(|_| ()),
            _ => Ok(()),
        }
    }

    async fn finish(
        &self,
        task: &OperationTask,
        status: OpStatus,
        exit_code: Option<i64>,
        logs: &[LogEntry],
    ) -> Result<(), CoreError> {
        let results = extract_results(&task.operation.results, logs);
        info!(
            flow_id = %task.flow_id,
            op_id = %task.operation.id,
            status = ?status,
            exit_code = ?exit_code,
            results = results.len(),
            "Operation finished"
        );

        let patch = OpStatePatch {
            results: Some(results),
            ..OpStatePatch::finished(status, exit_code, Utc::now())
        };
        self.update(task, patch).await
    }

    async fn fail_setup(&self, task: &OperationTask, err: CoreError) -> Result<(), CoreError> {
        warn!(flow_id = %task.flow_id, op_id = %task.operation.id, error = %err, "Operation setup failed");
        task.signal.abort(StopReason::Unknown);

        self.log(task, LogEntry::container(format!("Setup failed: {err}")))
            .await?;
        self.update(
            task,
            OpStatePatch::settled_without_start(OpStatus::Failed, Some(0), Utc::now()),
        )
        .await
    }

    async fn settle_aborted(&self, task: &OperationTask, reason: StopReason) -> Result<(), CoreError> {
        info!(flow_id = %task.flow_id, op_id = %task.operation.id, reason = %reason, "Operation aborted before start");
        self.update(
            task,
            OpStatePatch::finished(reason.op_status(), None, Utc::now()),
        )
        .await
    }
}

#[derive(Debug, Default)]
struct ConsumeOutcome {
    provider_id: Option<String>,
    error: Option<CoreError>,
}
