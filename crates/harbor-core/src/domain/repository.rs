//! Repository trait for flow state
//!
//! The execution engine persists every state change through this trait.
//! External crates implement it to provide different persistence mechanisms.

use async_trait::async_trait;

use super::flow::{
    Endpoint, EndpointStatus, Flow, FlowId, FlowMutation, FlowStatePatch, OpState, OpStatePatch,
};
use crate::types::LogEntry;
use crate::CoreError;

/// Durable key-value store of flows
///
/// Implementations only have to provide storage primitives and [`mutate`],
/// which must apply a mutation and persist the result under a single lock.
/// The named update helpers are expressed on top of it.
///
/// [`mutate`]: FlowRepository::mutate
#[async_trait]
pub trait FlowRepository: Send + Sync {
    /// Find a flow by ID
    async fn get_flow(&self, id: &FlowId) -> Result<Option<Flow>, CoreError>;

    /// Store a flow, replacing any previous value
    async fn set_flow(&self, id: &FlowId, flow: Flow) -> Result<(), CoreError>;

    /// Delete a flow
    async fn delete_flow(&self, id: &FlowId) -> Result<(), CoreError>;

    /// List every stored flow
    async fn list_flows(&self) -> Result<Vec<Flow>, CoreError>;

    /// Atomically apply a mutation and persist the result
    ///
    /// Returns the flow as stored after the mutation.
    async fn mutate(&self, id: &FlowId, mutation: FlowMutation) -> Result<Flow, CoreError>;

    /// Merge flow level fields
    async fn update_flow_state(
        &self,
        id: &FlowId,
        patch: FlowStatePatch,
    ) -> Result<Flow, CoreError> {
        self.mutate(id, FlowMutation::State(patch)).await
    }

    /// Read one operation state by position
    async fn get_op_state(&self, id: &FlowId, index: usize) -> Result<OpState, CoreError> {
        let flow = self
            .get_flow(id)
            .await?
            .ok_or_else(|| CoreError::FlowNotFound(id.to_string()))?;

        flow.state
            .op_states
            .get(index)
            .cloned()
            .ok_or_else(|| CoreError::OpStateNotFound {
                flow_id: id.to_string(),
                index,
            })
    }

    /// Merge an operation state
    async fn update_op_state(
        &self,
        id: &FlowId,
        index: usize,
        patch: OpStatePatch,
    ) -> Result<Flow, CoreError> {
        self.mutate(id, FlowMutation::OpState { index, patch }).await
    }

    /// Append a log chunk to an operation state
    async fn update_op_state_logs(
        &self,
        id: &FlowId,
        index: usize,
        log: LogEntry,
    ) -> Result<Flow, CoreError> {
        self.mutate(id, FlowMutation::OpLog { index, log }).await
    }

    /// Record or replace the endpoint of an exposed operation
    async fn set_endpoint(&self, id: &FlowId, endpoint: Endpoint) -> Result<Flow, CoreError> {
        self.mutate(id, FlowMutation::Endpoint(endpoint)).await
    }

    /// Change the availability of an endpoint
    async fn update_endpoint(
        &self,
        id: &FlowId,
        op_id: &str,
        status: EndpointStatus,
    ) -> Result<Flow, CoreError> {
        self.mutate(
            id,
            FlowMutation::EndpointStatus {
                op_id: op_id.to_string(),
                status,
            },
        )
        .await
    }
}
