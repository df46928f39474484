//! Flow, operation state and the stop table

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::job_definition::JobDefinition;
use crate::types::LogEntry;
use crate::CoreError;

/// Value object: Flow ID (one flow per claimed job)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FlowId {
    fn from(id: &str) -> Self {
        FlowId(id.to_string())
    }
}

/// Flow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowStatus {
    /// Created, not started yet
    Init,
    /// Groups are being executed
    Running,
    /// Finished (or expired)
    Success,
    /// Finished with a failure, or stopped by a quit
    Failed,
    /// Stopped on request
    Stopped,
    /// Rejected before execution by the plan builder
    ValidationError,
}

/// Operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    /// Not started
    Init,
    /// Container launched
    Running,
    /// Finished successfully
    Success,
    /// Finished with an error
    Failed,
    /// Stopped on request
    Stopped,
}

/// Why a flow is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// The job ran out of time
    Expired,
    /// The job poster or node operator stopped it
    Stopped,
    /// The node is shutting down
    Quit,
    /// Anything else
    Unknown,
}

impl StopReason {
    /// Statuses an operation and the flow settle on when stopped for this reason
    pub fn statuses(self) -> (OpStatus, FlowStatus) {
        match self {
            StopReason::Expired => (OpStatus::Success, FlowStatus::Success),
            StopReason::Stopped => (OpStatus::Stopped, FlowStatus::Stopped),
            StopReason::Quit => (OpStatus::Failed, FlowStatus::Failed),
            StopReason::Unknown => (OpStatus::Failed, FlowStatus::Failed),
        }
    }

    /// Status of an operation settled under this reason
    pub fn op_status(self) -> OpStatus {
        self.statuses().0
    }

    /// Status of a flow stopped for this reason
    pub fn flow_status(self) -> FlowStatus {
        self.statuses().1
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::Expired => "expired",
            StopReason::Stopped => "stopped",
            StopReason::Quit => "quit",
            StopReason::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Execution state of one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpState {
    /// Operation id
    pub operation_id: String,

    /// Runtime identifier (container id, volume name)
    #[serde(default)]
    pub provider_id: Option<String>,

    /// Hostname other operations of the flow can reach this one at
    #[serde(default)]
    pub host: Option<String>,

    /// Current status
    pub status: OpStatus,

    /// When the operation was started
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    /// When the operation settled; set means it will not run again
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    /// Container exit code
    #[serde(default)]
    pub exit_code: Option<i64>,

    /// User-visible log chunks
    #[serde(default)]
    pub logs: Vec<LogEntry>,

    /// Extracted results
    #[serde(default)]
    pub results: Option<BTreeMap<String, String>>,
}

impl OpState {
    /// Fresh state for an operation that has not run yet
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            provider_id: None,
            host: None,
            status: OpStatus::Init,
            start_time: None,
            end_time: None,
            exit_code: None,
            logs: Vec::new(),
            results: None,
        }
    }

    /// Whether the operation has settled for good
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// Merge a partial update
    pub fn apply(&mut self, patch: OpStatePatch) {
        if let Some(provider_id) = patch.provider_id {
            self.provider_id = Some(provider_id);
        }
        if let Some(host) = patch.host {
            self.host = Some(host);
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(start_time) = patch.start_time {
            self.start_time = start_time;
        }
        if let Some(end_time) = patch.end_time {
            self.end_time = end_time;
        }
        if let Some(exit_code) = patch.exit_code {
            self.exit_code = exit_code;
        }
        if let Some(results) = patch.results {
            self.results = Some(results);
        }
    }
}

/// Partial update of an operation state
///
/// `None` leaves a field untouched; the nested options of the nullable fields
/// allow clearing them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpStatePatch {
    /// New provider id
    pub provider_id: Option<String>,
    /// New host
    pub host: Option<String>,
    /// New status
    pub status: Option<OpStatus>,
    /// New start time
    pub start_time: Option<Option<DateTime<Utc>>>,
    /// New end time
    pub end_time: Option<Option<DateTime<Utc>>>,
    /// New exit code
    pub exit_code: Option<Option<i64>>,
    /// Extracted results
    pub results: Option<BTreeMap<String, String>>,
}

impl OpStatePatch {
    /// The operation's container is up
    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(OpStatus::Running),
            start_time: Some(Some(now)),
            end_time: Some(None),
            exit_code: Some(None),
            ..Default::default()
        }
    }

    /// The operation settled
    pub fn finished(status: OpStatus, exit_code: Option<i64>, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            end_time: Some(Some(now)),
            exit_code: Some(exit_code),
            ..Default::default()
        }
    }

    /// The operation settled without ever being started
    pub fn settled_without_start(
        status: OpStatus,
        exit_code: Option<i64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            start_time: Some(Some(now)),
            ..Self::finished(status, exit_code, now)
        }
    }
}

/// Availability of an exposed endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    /// Startup health checks passed
    Online,
    /// A continuous health check failed
    Offline,
}

/// Externally visible endpoint of an exposed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Operation serving the endpoint
    pub op_id: String,
    /// Address of the service
    pub url: String,
    /// Current availability
    pub status: EndpointStatus,
}

/// Mutable part of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    /// Flow status
    pub status: FlowStatus,

    /// When the flow started running
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    /// When the flow finished; set means it will not run again
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    /// One state per operation, in definition order
    pub op_states: Vec<OpState>,

    /// Flow level error messages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    /// Secrets made available to the flow
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, String>,

    /// Exposed endpoints keyed by operation id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoints: BTreeMap<String, Endpoint>,
}

/// Partial update of the flow level state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowStatePatch {
    /// New status
    pub status: Option<FlowStatus>,
    /// New start time
    pub start_time: Option<Option<DateTime<Utc>>>,
    /// New end time
    pub end_time: Option<Option<DateTime<Utc>>>,
    /// Errors to append
    pub errors: Vec<String>,
}

/// Atomic change applied to a stored flow
///
/// Repositories apply a mutation under a single lock, so conditional
/// transitions never race with concurrent writers.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowMutation {
    /// Merge flow level fields
    State(FlowStatePatch),

    /// Set the stop status, unless the flow already finished
    Stop(FlowStatus),

    /// Mark the flow finished: `running` becomes `success`, any other status is kept
    Finish(DateTime<Utc>),

    /// Merge an operation state
    OpState {
        /// Operation position
        index: usize,
        /// Changes
        patch: OpStatePatch,
    },

    /// Append a log chunk to an operation state
    OpLog {
        /// Operation position
        index: usize,
        /// Chunk
        log: LogEntry,
    },

    /// Record or replace an endpoint
    Endpoint(Endpoint),

    /// Change the availability of a known endpoint
    EndpointStatus {
        /// Operation serving the endpoint
        op_id: String,
        /// New availability
        status: EndpointStatus,
    },
}

/// Aggregate: one execution instance of a job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    /// Flow id
    pub id: FlowId,

    /// Definition being executed
    pub job_definition: JobDefinition,

    /// Execution state
    pub state: FlowState,
}

impl Flow {
    /// Create a flow with every operation in `init`
    pub fn new(id: FlowId, job_definition: JobDefinition) -> Self {
        let op_states = job_definition
            .ops
            .iter()
            .map(|op| OpState::new(op.id.clone()))
            .collect();

        Self {
            id,
            job_definition,
            state: FlowState {
                status: FlowStatus::Init,
                start_time: None,
                end_time: None,
                op_states,
                errors: Vec::new(),
                secrets: BTreeMap::new(),
                endpoints: BTreeMap::new(),
            },
        }
    }

    /// Whether the flow has finished for good
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state.end_time.is_some()
    }

    /// State of an operation by id
    pub fn op_state(&self, op_id: &str) -> Option<&OpState> {
        self.state
            .op_states
            .iter()
            .find(|state| state.operation_id == op_id)
    }

    /// Apply a mutation in place
    pub fn apply(&mut self, mutation: FlowMutation) -> Result<(), CoreError> {
        match mutation {
            FlowMutation::State(patch) => {
                if let Some(status) = patch.status {
                    self.state.status = status;
                }
                if let Some(start_time) = patch.start_time {
                    self.state.start_time = start_time;
                }
                if let Some(end_time) = patch.end_time {
                    self.state.end_time = end_time;
                }
                self.state.errors.extend(patch.errors);
            }
            FlowMutation::Stop(status) => {
                if !self.is_finished() {
                    self.state.status = status;
                }
            }
            FlowMutation::Finish(now) => {
                if self.state.status == FlowStatus::Running {
                    self.state.status = FlowStatus::Success;
                }
                self.state.end_time = Some(now);
            }
            FlowMutation::OpState { index, patch } => {
                self.op_state_mut(index)?.apply(patch);
            }
            FlowMutation::OpLog { index, log } => {
                self.op_state_mut(index)?.logs.push(log);
            }
            FlowMutation::Endpoint(endpoint) => {
                self.state
                    .endpoints
                    .insert(endpoint.op_id.clone(), endpoint);
            }
            FlowMutation::EndpointStatus { op_id, status } => {
                if let Some(endpoint) = self.state.endpoints.get_mut(&op_id) {
                    endpoint.status = status;
                }
            }
        }
        Ok(())
    }

    fn op_state_mut(&mut self, index: usize) -> Result<&mut OpState, CoreError> {
        let flow_id = self.id.0.clone();
        self.state
            .op_states
            .get_mut(index)
            .ok_or(CoreError::OpStateNotFound { flow_id, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job_definition::JobDefinition;
    use pretty_assertions::assert_eq;

    fn definition() -> JobDefinition {
        JobDefinition::from_json(
            r#"{"version":"0.1","type":"container","ops":[
                {"id":"a","type":"container/run","args":{"image":"ubuntu"}},
                {"id":"b","type":"container/run","args":{"image":"ubuntu"}}
            ]}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_stop_reason_table() {
        assert_eq!(
            StopReason::Expired.statuses(),
            (OpStatus::Success, FlowStatus::Success)
        );
        assert_eq!(
            StopReason::Stopped.statuses(),
            (OpStatus::Stopped, FlowStatus::Stopped)
        );
        assert_eq!(StopReason::Quit.statuses(), (OpStatus::Failed, FlowStatus::Failed));
        assert_eq!(
            StopReason::Unknown.statuses(),
            (OpStatus::Failed, FlowStatus::Failed)
        );
    }

    #[test]
    fn test_new_flow_has_one_init_state_per_operation() {
        let flow = Flow::new(FlowId::from("job"), definition());

        assert_eq!(flow.state.status, FlowStatus::Init);
        assert_eq!(flow.state.op_states.len(), 2);
        assert!(flow
            .state
            .op_states
            .iter()
            .all(|s| s.status == OpStatus::Init && !s.is_finished()));
        assert!(!flow.is_finished());
    }

    #[test]
    fn test_started_patch_clears_previous_outcome() {
        let mut state = OpState::new("a");
        let now = Utc::now();
        state.apply(OpStatePatch::finished(OpStatus::Failed, Some(1), now));

        state.apply(OpStatePatch::started(now));

        assert_eq!(state.status, OpStatus::Running);
        assert_eq!(state.end_time, None);
        assert_eq!(state.exit_code, None);
        assert_eq!(state.start_time, Some(now));
    }

    #[test]
    fn test_finish_only_promotes_running_flows() {
        let now = Utc::now();
        let mut running = Flow::new(FlowId::from("job"), definition());
        running.state.status = FlowStatus::Running;
        running.apply(FlowMutation::Finish(now)).unwrap();
        assert_eq!(running.state.status, FlowStatus::Success);
        assert_eq!(running.state.end_time, Some(now));

        let mut stopped = Flow::new(FlowId::from("job"), definition());
        stopped.state.status = FlowStatus::Stopped;
        stopped.apply(FlowMutation::Finish(now)).unwrap();
        assert_eq!(stopped.state.status, FlowStatus::Stopped);
    }

    #[test]
    fn test_stop_does_not_touch_finished_flows() {
        let mut flow = Flow::new(FlowId::from("job"), definition());
        flow.state.status = FlowStatus::Success;
        flow.state.end_time = Some(Utc::now());

        flow.apply(FlowMutation::Stop(FlowStatus::Stopped)).unwrap();

        assert_eq!(flow.state.status, FlowStatus::Success);
    }

    #[test]
    fn test_out_of_range_op_state_is_an_error() {
        let mut flow = Flow::new(FlowId::from("job"), definition());

        let err = flow
            .apply(FlowMutation::OpLog {
                index: 7,
                log: LogEntry::stdout("x"),
            })
            .unwrap_err();

        assert_eq!(
            err,
            CoreError::OpStateNotFound {
                flow_id: "job".to_string(),
                index: 7
            }
        );
    }

    #[test]
    fn test_flow_status_wire_names() {
        assert_eq!(
            serde_json::to_value(FlowStatus::ValidationError).unwrap(),
            serde_json::json!("validation-error")
        );
        assert_eq!(
            serde_json::to_value(OpStatus::Stopped).unwrap(),
            serde_json::json!("stopped")
        );
    }
}
