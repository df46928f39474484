//! Harbor node - runs one job definition on the local container runtime.
//!
//! The node loads a job definition from a JSON file, persists the flow into a
//! state directory, drives the execution engine against the Docker CLI and
//! hosts the housekeeping the engine does not own: resource cache resync,
//! retention of finished flows, signal handling and job expiry.

pub mod background;
pub mod config;
pub mod error;
pub mod node;
pub mod shutdown;

pub use config::NodeConfig;
pub use error::{NodeError, NodeResult};
pub use node::Node;

use tracing::info;

use harbor_core::Flow;

/// Run the configured job until it finishes or the process is signalled
pub async fn run(config: NodeConfig) -> anyhow::Result<Flow> {
    let shutdown = shutdown::install_shutdown_handler()?;
    let node = Node::new(config).await?;
    let flow = node.run(shutdown).await?;

    info!(
        flow_id = %flow.id,
        status = ?flow.state.status,
        errors = flow.state.errors.len(),
        "Job finished"
    );
    Ok(flow)
}
