//! Flow scheduling
//!
//! The [`TaskManager`] owns the execution plan of one flow. It runs the groups
//! of the plan strictly in order, launches every operation of a group whose
//! readiness dependencies are met, launches the others as soon as the
//! operations they wait on report readiness, and waits for the whole group
//! before moving on.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use super::abort::AbortSignal;
use super::operation_provider::OperationProvider;
use super::operation_runner::{OperationRunner, OperationTask, ReadySignal};
use crate::domain::execution_plan::{EdgeKind, ExecutionContext, ExecutionPlan, PlanError};
use crate::domain::flow::{
    Flow, FlowId, FlowMutation, FlowStatePatch, FlowStatus, OpStatePatch, OpStatus, StopReason,
};
use crate::domain::job_definition::{JobDefinition, OperationType};
use crate::domain::repository::FlowRepository;
use crate::types::LogEntry;
use crate::CoreError;

type RunnerFuture = BoxFuture<'static, (String, Result<Result<(), CoreError>, JoinError>)>;

/// Schedules and supervises the operations of one flow
pub struct TaskManager {
    flow_id: FlowId,
    definition: JobDefinition,
    plan: ExecutionPlan,
    repository: Arc<dyn FlowRepository>,
    provider: Arc<OperationProvider>,
    runner: Arc<OperationRunner>,
    main: AbortSignal,
}

impl TaskManager {
    /// Build the execution plan of a job definition
    ///
    /// Fails without touching the repository when the definition is invalid;
    /// see [`TaskManager::reject`] to record the rejection.
    pub fn new(
        flow_id: FlowId,
        definition: JobDefinition,
        repository: Arc<dyn FlowRepository>,
        provider: Arc<OperationProvider>,
    ) -> Result<Self, PlanError> {
        let plan = ExecutionPlan::build(&definition.ops)?;
        let runner = Arc::new(OperationRunner::new(
            Arc::clone(&repository),
            Arc::clone(&provider),
        ));

        Ok(Self {
            flow_id,
            definition,
            plan,
            repository,
            provider,
            runner,
            main: AbortSignal::new(),
        })
    }

    /// Persist a flow for a definition that failed plan validation
    ///
    /// The flow is finished on arrival: status `validation-error`, end time
    /// set, every operation left in `init`.
    pub async fn reject(
        repository: &dyn FlowRepository,
        flow_id: FlowId,
        definition: JobDefinition,
        plan_error: &PlanError,
    ) -> Result<Flow, CoreError> {
        warn!(flow_id = %flow_id, error = %plan_error, "Rejecting invalid job definition");

        let mut flow = Flow::new(flow_id.clone(), definition);
        let now = Utc::now();
        flow.state.status = FlowStatus::ValidationError;
        flow.state.start_time = Some(now);
        flow.state.end_time = Some(now);
        flow.state.errors = plan_error
            .errors()
            .iter()
            .map(|err| err.to_string())
            .collect();

        repository.set_flow(&flow_id, flow.clone()).await?;
        Ok(flow)
    }

    /// Flow id
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Execution plan
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Main abort signal of the flow
    pub fn abort_signal(&self) -> &AbortSignal {
        &self.main
    }

    /// Create the flow in the repository unless it already exists
    pub async fn init(&self) -> Result<(), CoreError> {
        if self.repository.get_flow(&self.flow_id).await?.is_some() {
            debug!(flow_id = %self.flow_id, "Flow already initialized");
            return Ok(());
        }

        let flow = Flow::new(self.flow_id.clone(), self.definition.clone());
        self.repository.set_flow(&self.flow_id, flow).await?;
        info!(flow_id = %self.flow_id, ops = self.plan.len(), "Flow initialized");
        Ok(())
    }

    /// Run every unfinished operation of the flow
    ///
    /// Returns immediately for a flow that already finished.
    pub async fn run(&self) -> Result<(), CoreError> {
        let flow = self
            .repository
            .get_flow(&self.flow_id)
            .await?
            .ok_or_else(|| CoreError::FlowNotFound(self.flow_id.to_string()))?;

        if flow.is_finished() {
            info!(flow_id = %self.flow_id, status = ?flow.state.status, "Flow already finished");
            return Ok(());
        }

        self.repository
            .update_flow_state(
                &self.flow_id,
                FlowStatePatch {
                    status: Some(FlowStatus::Running),
                    start_time: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        // A stop that landed before the flow was marked running
        if let Some(reason) = self.main.reason() {
            self.repository
                .mutate(&self.flow_id, FlowMutation::Stop(reason.flow_status()))
                .await?;
        }

        info!(flow_id = %self.flow_id, groups = self.plan.groups().len(), "Running flow");
        let outcome = self.run_groups(&flow).await;
        self.teardown().await;

        match outcome {
            Ok(()) => {
                let flow = self
                    .repository
                    .mutate(&self.flow_id, FlowMutation::Finish(Utc::now()))
                    .await?;
                info!(flow_id = %self.flow_id, status = ?flow.state.status, "Flow finished");
                Ok(())
            }
            Err(err) => {
                error!(flow_id = %self.flow_id, error = %err, "Flow failed");
                self.repository
                    .update_flow_state(
                        &self.flow_id,
                        FlowStatePatch {
                            status: Some(FlowStatus::Failed),
                            end_time: Some(Some(Utc::now())),
                            errors: vec![err.to_string()],
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// Stop the flow
    ///
    /// Records the flow status the reason maps to, then aborts every running
    /// operation.
    pub async fn stop(&self, reason: StopReason) -> Result<(), CoreError> {
        info!(flow_id = %self.flow_id, reason = %reason, "Stopping flow");

        let recorded = self
            .repository
            .mutate(&self.flow_id, FlowMutation::Stop(reason.flow_status()))
            .await;
        self.main.abort(reason);

        recorded.map(|_| ())
    }

    async fn run_groups(&self, flow: &Flow) -> Result<(), CoreError> {
        self.provider.prepare_flow(&self.flow_id).await?;

        for group in self.plan.groups() {
            self.run_group(group, flow).await?;
        }
        Ok(())
    }

    async fn run_group(&self, group: &ExecutionContext, flow: &Flow) -> Result<(), CoreError> {
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<ReadySignal>();
        let mut running: FuturesUnordered<RunnerFuture> = FuturesUnordered::new();
        // Operation id -> dependencies that have not signalled readiness yet
        let mut waiting: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for op_id in &group.ops {
            let index = self.index_of(op_id)?;
            let finished = flow
                .state
                .op_states
                .get(index)
                .map(|state| state.is_finished())
                .unwrap_or(false);
            if finished {
                debug!(flow_id = %self.flow_id, op_id = %op_id, "Skipping finished operation");
                continue;
            }

            let unmet: BTreeSet<String> = self
                .plan
                .dependency_context(op_id)
                .map(|ctx| {
                    ctx.dependencies
                        .iter()
                        .filter(|edge| edge.kind == EdgeKind::Ready)
                        .filter(|edge| !Self::already_succeeded(flow, &edge.op_id))
                        .map(|edge| edge.op_id.clone())
                        .collect()
                })
                .unwrap_or_default();

            if unmet.is_empty() {
                running.push(self.launch(op_id, index, &ready_tx)?);
            } else {
                waiting.insert(op_id.clone(), unmet);
            }
        }

        info!(
            flow_id = %self.flow_id,
            group = %group.group,
            launched = running.len(),
            waiting = waiting.len(),
            "Group started"
        );

        loop {
            while let Ok(signal) = ready_rx.try_recv() {
                self.unlock(signal, &mut waiting, &mut running, &ready_tx)?;
            }
            if running.is_empty() {
                break;
            }

            tokio::select! {
                Some(signal) = ready_rx.recv() => {
                    self.unlock(signal, &mut waiting, &mut running, &ready_tx)?;
                }
                Some((op_id, result)) = running.next() => match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!(flow_id = %self.flow_id, op_id = %op_id, error = %err, "Operation runner failed");
                    }
                    Err(err) => {
                        error!(flow_id = %self.flow_id, op_id = %op_id, error = %err, "Operation runner panicked");
                    }
                },
            }
        }

        self.settle_unmet(waiting).await
    }

    fn unlock(
        &self,
        signal: ReadySignal,
        waiting: &mut BTreeMap<String, BTreeSet<String>>,
        running: &mut FuturesUnordered<RunnerFuture>,
        ready_tx: &mpsc::UnboundedSender<ReadySignal>,
    ) -> Result<(), CoreError> {
        for dependent in &signal.dependents {
            let Some(unmet) = waiting.get_mut(dependent) else {
                continue;
            };
            unmet.remove(&signal.op_id);
            if unmet.is_empty() {
                waiting.remove(dependent);
                debug!(flow_id = %self.flow_id, op_id = %dependent, trigger = %signal.op_id, "Dependencies ready");
                let index = self.index_of(dependent)?;
                running.push(self.launch(dependent, index, ready_tx)?);
            }
        }
        Ok(())
    }

    fn launch(
        &self,
        op_id: &str,
        index: usize,
        ready_tx: &mpsc::UnboundedSender<ReadySignal>,
    ) -> Result<RunnerFuture, CoreError> {
        let operation = self
            .plan
            .operation(op_id)
            .cloned()
            .ok_or_else(|| CoreError::OperationNotFound(op_id.to_string()))?;

        let task = OperationTask {
            flow_id: self.flow_id.clone(),
            index,
            operation,
            dependents: self.plan.ready_dependents(op_id),
            signal: self.main.child(),
            ready: ready_tx.clone(),
        };

        let runner = Arc::clone(&self.runner);
        let handle = tokio::spawn(async move { runner.run(task).await });
        let op_id = op_id.to_string();

        Ok(async move { (op_id, handle.await) }.boxed())
    }

    // Operations whose dependencies settled without ever becoming ready.
    async fn settle_unmet(
        &self,
        waiting: BTreeMap<String, BTreeSet<String>>,
    ) -> Result<(), CoreError> {
        let status = self
            .main
            .reason()
            .map(StopReason::op_status)
            .unwrap_or(OpStatus::Failed);

        for (op_id, unmet) in waiting {
            let index = self.index_of(&op_id)?;
            let unmet: Vec<&str> = unmet.iter().map(String::as_str).collect();
            warn!(flow_id = %self.flow_id, op_id = %op_id, unmet = ?unmet, "Operation never started");

            self.repository
                .update_op_state_logs(
                    &self.flow_id,
                    index,
                    LogEntry::container(format!(
                        "Not started: dependencies never became ready: {}",
                        unmet.join(", ")
                    )),
                )
                .await?;
            self.repository
                .update_op_state(
                    &self.flow_id,
                    index,
                    OpStatePatch::finished(status, None, Utc::now()),
                )
                .await?;
        }
        Ok(())
    }

    async fn teardown(&self) {
        let volumes = match self.repository.get_flow(&self.flow_id).await {
            Ok(Some(flow)) => flow
                .job_definition
                .ops
                .iter()
                .zip(&flow.state.op_states)
                .filter(|(op, _)| op.op_type == OperationType::ContainerCreateVolume)
                .filter_map(|(_, state)| state.provider_id.clone())
                .collect(),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(flow_id = %self.flow_id, error = %err, "Failed to read flow for teardown");
                Vec::new()
            }
        };

        self.provider.teardown_flow(&self.flow_id, &volumes).await;
    }

    fn already_succeeded(flow: &Flow, op_id: &str) -> bool {
        flow.op_state(op_id)
            .map(|state| state.is_finished() && state.status == OpStatus::Success)
            .unwrap_or(false)
    }

    fn index_of(&self, op_id: &str) -> Result<usize, CoreError> {
        self.plan
            .index_of(op_id)
            .ok_or_else(|| CoreError::OperationNotFound(op_id.to_string()))
    }
}
