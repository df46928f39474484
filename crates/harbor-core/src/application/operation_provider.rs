//! Operation providers
//!
//! A provider turns one prepared operation into container runtime calls and
//! reports what happens through [`OperationEvent`]s. Every execution emits
//! exactly one [`OperationEvent::End`], always last.

use futures::stream::{BoxStream, StreamExt};
use regex::Regex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::abort::AbortSignal;
use super::container_runtime::{
    ContainerHandle, ContainerRuntime, RunContainerOptions, VolumeBinding,
};
use super::resource_cache::ResourceCache;
use crate::domain::flow::{FlowId, OpStatePatch};
use crate::domain::interpolation::InterpolationStore;
use crate::domain::job_definition::{
    ContainerRunArgs, ContainerSpec, CreateVolumeArgs, GlobalSettings, HealthCheck, Operation,
    OperationType,
};
use crate::types::{EngineConfig, LogEntry};
use crate::CoreError;

/// Lifecycle event of a running operation
#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    /// The operation's resource is up
    Start,
    /// Log chunk
    Log(LogEntry),
    /// Partial operation state update (provider id, host)
    UpdateOpState(OpStatePatch),
    /// Startup health checks passed; dependents may start
    StartupHealthy,
    /// A continuous health check failed
    ContinuousUnhealthy,
    /// The operation finished with an exit code
    Exit(i64),
    /// The operation failed before producing an exit code
    Error(String),
    /// Nothing else will be emitted
    End,
}

/// Sending half of an operation's event channel
pub type EventSender = mpsc::Sender<OperationEvent>;

/// Name of the network shared by the containers of a flow
pub fn flow_network_name(flow_id: &FlowId) -> String {
    format!("harbor-{}", sanitize(&flow_id.0))
}

/// Name (and hostname) of the container of an operation
pub fn container_name(flow_id: &FlowId, op_id: &str) -> String {
    format!("harbor-{}-{}", sanitize(&flow_id.0), sanitize(op_id))
}

/// Runtime name of a flow scoped volume
pub fn volume_name(flow_id: &FlowId, name: &str) -> String {
    format!("harbor-{}-{}", sanitize(&flow_id.0), sanitize(name))
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Operation whose arguments are interpolated and normalized
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedOperation {
    /// `container/run`
    ContainerRun(ContainerSpec),
    /// `container/create-volume`
    CreateVolume(CreateVolumeArgs),
}

impl PreparedOperation {
    /// Interpolate and normalize the arguments of an operation
    pub fn prepare(
        operation: &Operation,
        global: Option<&GlobalSettings>,
        store: &InterpolationStore,
    ) -> Result<Self, CoreError> {
        let args = store.interpolate(&operation.args)?;
        let invalid = |err: serde_json::Error| CoreError::InvalidArguments {
            op_id: operation.id.clone(),
            message: err.to_string(),
        };

        match operation.op_type {
            OperationType::ContainerRun => {
                let args: ContainerRunArgs = if args.is_null() {
                    ContainerRunArgs::default()
                } else {
                    serde_json::from_value(args).map_err(invalid)?
                };
                Ok(PreparedOperation::ContainerRun(
                    args.normalize(&operation.id, global)?,
                ))
            }
            OperationType::ContainerCreateVolume => Ok(PreparedOperation::CreateVolume(
                serde_json::from_value(args).map_err(invalid)?,
            )),
        }
    }

    /// Port the operation serves, if it is exposed
    pub fn exposed_port(&self) -> Option<u16> {
        match self {
            PreparedOperation::ContainerRun(spec) => spec.expose,
            PreparedOperation::CreateVolume(_) => None,
        }
    }
}

/// Identity of an execution
#[derive(Debug, Clone)]
pub struct ProviderContext {
    /// Flow the operation belongs to
    pub flow_id: FlowId,
    /// Operation id
    pub op_id: String,
    /// Per-operation abort signal
    pub signal: AbortSignal,
}

/// Executes prepared operations against a container runtime
pub struct OperationProvider {
    runtime: Arc<dyn ContainerRuntime>,
    cache: Arc<ResourceCache>,
    config: EngineConfig,
    http: reqwest::Client,
}

impl OperationProvider {
    /// Create a new provider
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        cache: Arc<ResourceCache>,
        config: EngineConfig,
    ) -> Self {
        // Probes go straight to container addresses
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .no_proxy()
            .build()
            .unwrap_or_default();

        Self {
            runtime,
            cache,
            config,
            http,
        }
    }

    /// Runtime the provider drives
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Engine tunables
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create the resources shared by every operation of a flow
    pub async fn prepare_flow(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        let network = flow_network_name(flow_id);
        debug!(flow_id = %flow_id, network = %network, "Creating flow network");
        self.runtime.create_network(&network).await?;
        Ok(())
    }

    /// Remove the resources shared by the operations of a finished flow
    ///
    /// Failures are logged, never returned.
    pub async fn teardown_flow(&self, flow_id: &FlowId, volumes: &[String]) {
        for volume in volumes {
            if let Err(err) = self.runtime.delete_volume(volume).await {
                warn!(flow_id = %flow_id, volume = %volume, error = %err, "Failed to delete volume");
            }
        }

        let network = flow_network_name(flow_id);
        if let Err(err) = self.runtime.delete_network(&network).await {
            warn!(flow_id = %flow_id, network = %network, error = %err, "Failed to delete flow network");
        }
    }

    /// Execute an operation, reporting through `events`
    pub async fn execute(
        &self,
        ctx: &ProviderContext,
        operation: PreparedOperation,
        events: &EventSender,
    ) {
        let outcome = match operation {
            PreparedOperation::ContainerRun(spec) => self.run_container(ctx, spec, events).await,
            PreparedOperation::CreateVolume(args) => self.create_volume(ctx, args, events).await,
        };

        match outcome {
            Ok(exit_code) => emit(events, OperationEvent::Exit(exit_code)).await,
            Err(err) => emit(events, OperationEvent::Error(err.to_string())).await,
        }
        emit(events, OperationEvent::End).await;
    }

    /// Release what an execution left behind
    ///
    /// Failures are logged, never returned.
    pub async fn cleanup(&self, ctx: &ProviderContext, operation: &PreparedOperation, provider_id: Option<&str>) {
        let (PreparedOperation::ContainerRun(_), Some(id)) = (operation, provider_id) else {
            return;
        };

        match self.runtime.does_container_exist(id).await {
            Ok(true) => {
                if let Err(err) = self.runtime.stop_and_delete_container(id).await {
                    warn!(flow_id = %ctx.flow_id, op_id = %ctx.op_id, error = %err, "Failed to remove container");
                }
            }
            Ok(false) => {}
            Err(err) => {
                warn!(flow_id = %ctx.flow_id, op_id = %ctx.op_id, error = %err, "Failed to inspect container");
            }
        }
    }

    async fn create_volume(
        &self,
        ctx: &ProviderContext,
        args: CreateVolumeArgs,
        events: &EventSender,
    ) -> Result<i64, CoreError> {
        let name = volume_name(&ctx.flow_id, &args.name);
        let volume = self.runtime.create_volume(Some(name)).await?;
        self.cache.set_volume_used(&volume.name);

        emit(
            events,
            OperationEvent::UpdateOpState(OpStatePatch {
                provider_id: Some(volume.name.clone()),
                ..Default::default()
            }),
        )
        .await;
        emit(events, OperationEvent::Start).await;
        emit(
            events,
            OperationEvent::Log(LogEntry::container(format!("Volume {} created", args.name))),
        )
        .await;
        emit(events, OperationEvent::StartupHealthy).await;
        Ok(0)
    }

    async fn run_container(
        &self,
        ctx: &ProviderContext,
        spec: ContainerSpec,
        events: &EventSender,
    ) -> Result<i64, CoreError> {
        emit(
            events,
            OperationEvent::Log(LogEntry::container(format!("Pulling image {}", spec.image))),
        )
        .await;
        self.runtime
            .pull_image(&spec.image, ctx.signal.token())
            .await?;
        self.cache.set_image_used(&spec.image);

        let options = RunContainerOptions {
            name: container_name(&ctx.flow_id, &ctx.op_id),
            cmd: spec.cmd.clone(),
            entrypoint: spec.entrypoint.clone(),
            env: spec.env.clone(),
            networks: vec![flow_network_name(&ctx.flow_id)],
            volumes: spec
                .volumes
                .iter()
                .map(|mount| VolumeBinding {
                    name: volume_name(&ctx.flow_id, &mount.name),
                    dest: mount.dest.clone(),
                })
                .collect(),
            gpu: spec.gpu,
            work_dir: spec.work_dir.clone(),
        };
        let handle = self
            .runtime
            .run_container(&spec.image, &options, ctx.signal.token())
            .await?;

        info!(flow_id = %ctx.flow_id, op_id = %ctx.op_id, container = %handle.id, "Container started");
        emit(
            events,
            OperationEvent::UpdateOpState(OpStatePatch {
                provider_id: Some(handle.id.clone()),
                host: Some(handle.name.clone()),
                ..Default::default()
            }),
        )
        .await;
        emit(events, OperationEvent::Start).await;

        let logs = self.runtime.container_logs(&handle.id).await?;
        self.supervise(ctx, &spec, &handle, logs, events).await
    }

    // Streams logs, runs health checks and reacts to aborts until the container exits.
    async fn supervise(
        &self,
        ctx: &ProviderContext,
        spec: &ContainerSpec,
        handle: &ContainerHandle,
        mut logs: BoxStream<'static, LogEntry>,
        events: &EventSender,
    ) -> Result<i64, CoreError> {
        let mut health = HealthTracker::new(&spec.health_checks)?;
        if health.is_startup_healthy() {
            emit(events, OperationEvent::StartupHealthy).await;
        }

        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let startup_deadline = tokio::time::sleep(self.config.startup_timeout);
        tokio::pin!(startup_deadline);

        let mut wait = self.runtime.wait_container(&handle.id);
        let mut logs_done = false;
        let mut stop_requested = false;

        let exit = loop {
            tokio::select! {
                _ = ctx.signal.aborted(), if !stop_requested => {
                    stop_requested = true;
                    let reason = ctx.signal.reason().map(|r| r.to_string()).unwrap_or_default();
                    emit(events, OperationEvent::Log(LogEntry::info(format!("Stopping container ({reason})")))).await;
                    if let Err(err) = self.runtime.stop_and_delete_container(&handle.id).await {
                        warn!(flow_id = %ctx.flow_id, op_id = %ctx.op_id, error = %err, "Failed to stop container");
                    }
                }
                entry = logs.next(), if !logs_done => match entry {
                    Some(entry) => {
                        trace!(op_id = %ctx.op_id, log = %entry.log, "Container output");
                        let became_healthy = health.observe_log(&entry.log);
                        emit(events, OperationEvent::Log(entry)).await;
                        if became_healthy {
                            emit(events, OperationEvent::StartupHealthy).await;
                        }
                    }
                    None => logs_done = true,
                },
                _ = ticker.tick(), if health.wants_probe() => {
                    match self.probe(handle, spec.expose, &mut health).await {
                        ProbeOutcome::BecameHealthy => emit(events, OperationEvent::StartupHealthy).await,
                        ProbeOutcome::BecameUnhealthy => emit(events, OperationEvent::ContinuousUnhealthy).await,
                        ProbeOutcome::Unchanged => {}
                    }
                }
                _ = &mut startup_deadline, if !health.is_startup_healthy() && !stop_requested => {
                    emit(events, OperationEvent::Log(LogEntry::container("Startup health checks timed out"))).await;
                    if let Err(err) = self.runtime.stop_and_delete_container(&handle.id).await {
                        warn!(flow_id = %ctx.flow_id, op_id = %ctx.op_id, error = %err, "Failed to stop container");
                    }
                    return Err(CoreError::HealthCheckFailed(format!(
                        "startup health checks did not pass within {}s",
                        self.config.startup_timeout.as_secs()
                    )));
                }
                result = &mut wait => break result,
            }
        };

        if !logs_done {
            let drain = async {
                while let Some(entry) = logs.next().await {
                    let became_healthy = health.observe_log(&entry.log);
                    emit(events, OperationEvent::Log(entry)).await;
                    if became_healthy {
                        emit(events, OperationEvent::StartupHealthy).await;
                    }
                }
            };
            if tokio::time::timeout(self.config.log_drain_timeout, drain)
                .await
                .is_err()
            {
                debug!(op_id = %ctx.op_id, "Log stream still open after container exit");
            }
        }

        Ok(exit?)
    }

    async fn probe(
        &self,
        handle: &ContainerHandle,
        port: Option<u16>,
        health: &mut HealthTracker,
    ) -> ProbeOutcome {
        let address = match self.runtime.get_container(&handle.id).await {
            Ok(info) => info.ip_address,
            Err(err) => {
                debug!(container = %handle.id, error = %err, "Container not inspectable for probing");
                None
            }
        };
        let port = port.unwrap_or(80);

        let mut outcomes = Vec::with_capacity(health.http.len());
        for check in &health.http {
            let ok = match &address {
                Some(address) => {
                    let url = format!("http://{}:{}{}", address, port, check.path);
                    match self.http.get(&url).send().await {
                        Ok(response) => response.status().as_u16() == check.expected_status,
                        Err(err) => {
                            trace!(url = %url, error = %err, "Probe failed");
                            false
                        }
                    }
                }
                None => false,
            };
            outcomes.push(ok);
        }

        health.record_probes(&outcomes)
    }
}

async fn emit(events: &EventSender, event: OperationEvent) {
    // The runner only drops its receiver once End was consumed.
    let _ = events.send(event).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    BecameHealthy,
    BecameUnhealthy,
    Unchanged,
}

#[derive(Debug)]
struct HttpCheck {
    path: String,
    expected_status: u16,
    continuous: bool,
    passed: bool,
}

#[derive(Debug)]
struct LogCheck {
    pattern: Regex,
    passed: bool,
}

#[derive(Debug)]
struct HealthTracker {
    http: Vec<HttpCheck>,
    log: Vec<LogCheck>,
    startup_healthy: bool,
    continuous_failing: bool,
}

impl HealthTracker {
    fn new(checks: &[HealthCheck]) -> Result<Self, CoreError> {
        let mut http = Vec::new();
        let mut log = Vec::new();

        for check in checks {
            match check {
                HealthCheck::Http {
                    path,
                    expected_status,
                    continuous,
                } => http.push(HttpCheck {
                    path: path.clone(),
                    expected_status: *expected_status,
                    continuous: *continuous,
                    passed: false,
                }),
                HealthCheck::Log { pattern } => log.push(LogCheck {
                    pattern: Regex::new(pattern).map_err(|err| {
                        CoreError::HealthCheckFailed(format!("invalid log pattern: {err}"))
                    })?,
                    passed: false,
                }),
            }
        }

        let startup_healthy = http.is_empty() && log.is_empty();
        Ok(Self {
            http,
            log,
            startup_healthy,
            continuous_failing: false,
        })
    }

    fn is_startup_healthy(&self) -> bool {
        self.startup_healthy
    }

    fn wants_probe(&self) -> bool {
        if self.startup_healthy {
            self.http.iter().any(|check| check.continuous)
        } else {
            self.http.iter().any(|check| !check.passed)
        }
    }

    // Returns true on the transition to healthy.
    fn observe_log(&mut self, line: &str) -> bool {
        if self.startup_healthy {
            return false;
        }
        for check in self.log.iter_mut().filter(|check| !check.passed) {
            check.passed = check.pattern.is_match(line);
        }
        self.settle_startup()
    }

    fn record_probes(&mut self, outcomes: &[bool]) -> ProbeOutcome {
        if self.startup_healthy {
            let failing = self
                .http
                .iter()
                .zip(outcomes)
                .any(|(check, ok)| check.continuous && !ok);
            let outcome = if failing && !self.continuous_failing {
                ProbeOutcome::BecameUnhealthy
            } else {
                ProbeOutcome::Unchanged
            };
            self.continuous_failing = failing;
            return outcome;
        }

        for (check, ok) in self.http.iter_mut().zip(outcomes) {
            check.passed |= *ok;
        }
        if self.settle_startup() {
            ProbeOutcome::BecameHealthy
        } else {
            ProbeOutcome::Unchanged
        }
    }

    fn settle_startup(&mut self) -> bool {
        let all_passed = self.http.iter().all(|check| check.passed)
            && self.log.iter().all(|check| check.passed);
        if all_passed && !self.startup_healthy {
            self.startup_healthy = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn http(continuous: bool) -> HealthCheck {
        HealthCheck::Http {
            path: "/health".to_string(),
            expected_status: 200,
            continuous,
        }
    }

    #[test]
    fn test_resource_names() {
        let flow_id = FlowId::from("job/42");
        assert_eq!(flow_network_name(&flow_id), "harbor-job-42");
        assert_eq!(container_name(&flow_id, "train model"), "harbor-job-42-train-model");
        assert_eq!(volume_name(&flow_id, "data"), "harbor-job-42-data");
    }

    #[test]
    fn test_prepare_interpolates_then_normalizes() {
        let operation: Operation = serde_json::from_value(json!({
            "id": "client",
            "type": "container/run",
            "args": { "image": "curl", "cmd": "curl http://%%ops.server.host%%/", "expose": 8080 }
        }))
        .unwrap();
        let store = InterpolationStore::default().with_host("server", "harbor-job-server");

        let prepared = PreparedOperation::prepare(&operation, None, &store).unwrap();

        match &prepared {
            PreparedOperation::ContainerRun(spec) => assert_eq!(
                spec.cmd,
                vec!["/bin/sh", "-c", "curl http://harbor-job-server/"]
            ),
            other => panic!("Expected ContainerRun, got {:?}", other),
        }
        assert_eq!(prepared.exposed_port(), Some(8080));
    }

    #[test]
    fn test_prepare_rejects_mistyped_arguments() {
        let operation: Operation = serde_json::from_value(json!({
            "id": "vol",
            "type": "container/create-volume",
            "args": { "label": "data" }
        }))
        .unwrap();

        match PreparedOperation::prepare(&operation, None, &InterpolationStore::default()) {
            Err(CoreError::InvalidArguments { op_id, .. }) => assert_eq!(op_id, "vol"),
            other => panic!("Expected InvalidArguments, got {:?}", other),
        }
    }

    #[test]
    fn test_no_checks_means_healthy_immediately() {
        let tracker = HealthTracker::new(&[]).unwrap();
        assert!(tracker.is_startup_healthy());
        assert!(!tracker.wants_probe());
    }

    #[test]
    fn test_log_check_turns_healthy_once() {
        let mut tracker = HealthTracker::new(&[HealthCheck::Log {
            pattern: "listening on \\d+".to_string(),
        }])
        .unwrap();

        assert!(!tracker.observe_log("booting"));
        assert!(tracker.observe_log("listening on 8080"));
        assert!(!tracker.observe_log("listening on 8080"));
        assert!(tracker.is_startup_healthy());
    }

    #[test]
    fn test_http_checks_startup_then_continuous() {
        let mut tracker = HealthTracker::new(&[http(false), http(true)]).unwrap();
        assert!(tracker.wants_probe());

        assert_eq!(tracker.record_probes(&[true, false]), ProbeOutcome::Unchanged);
        assert_eq!(tracker.record_probes(&[false, true]), ProbeOutcome::BecameHealthy);

        // Only the continuous check keeps being probed
        assert!(tracker.wants_probe());
        assert_eq!(tracker.record_probes(&[true, false]), ProbeOutcome::BecameUnhealthy);
        assert_eq!(tracker.record_probes(&[true, false]), ProbeOutcome::Unchanged);
        assert_eq!(tracker.record_probes(&[true, true]), ProbeOutcome::Unchanged);
        assert_eq!(tracker.record_probes(&[true, false]), ProbeOutcome::BecameUnhealthy);
    }

    #[test]
    fn test_invalid_log_pattern() {
        let err = HealthTracker::new(&[HealthCheck::Log {
            pattern: "(".to_string(),
        }])
        .unwrap_err();
        assert!(matches!(err, CoreError::HealthCheckFailed(_)));
    }
}
