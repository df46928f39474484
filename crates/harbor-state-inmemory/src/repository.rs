use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use harbor_core::domain::flow::{Flow, FlowId, FlowMutation};
use harbor_core::domain::repository::FlowRepository;
use harbor_core::CoreError;

/// In-memory implementation of the FlowRepository
#[derive(Debug, Clone, Default)]
pub struct InMemoryFlowRepository {
    flows: Arc<RwLock<HashMap<String, Flow>>>,
}

impl InMemoryFlowRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a repository over existing shared storage
    pub fn with_storage(flows: Arc<RwLock<HashMap<String, Flow>>>) -> Self {
        Self { flows }
    }
}

#[async_trait]
impl FlowRepository for InMemoryFlowRepository {
    async fn get_flow(&self, id: &FlowId) -> Result<Option<Flow>, CoreError> {
        let flows = self.flows.read().await;
        Ok(flows.get(&id.0).cloned())
    }

    async fn set_flow(&self, id: &FlowId, flow: Flow) -> Result<(), CoreError> {
        let mut flows = self.flows.write().await;
        flows.insert(id.0.clone(), flow);
        Ok(())
    }

    async fn delete_flow(&self, id: &FlowId) -> Result<(), CoreError> {
        let mut flows = self.flows.write().await;
        if flows.remove(&id.0).is_some() {
            debug!(flow_id = %id, "Flow deleted");
        }
        Ok(())
    }

    async fn list_flows(&self) -> Result<Vec<Flow>, CoreError> {
        let flows = self.flows.read().await;
        let mut result: Vec<Flow> = flows.values().cloned().collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(result)
    }

    async fn mutate(&self, id: &FlowId, mutation: FlowMutation) -> Result<Flow, CoreError> {
        let mut flows = self.flows.write().await;
        let flow = flows
            .get_mut(&id.0)
            .ok_or_else(|| CoreError::FlowNotFound(id.to_string()))?;

        // A failed mutation leaves the stored flow untouched
        let mut updated = flow.clone();
        updated.apply(mutation)?;
        *flow = updated.clone();
        Ok(updated)
    }
}
