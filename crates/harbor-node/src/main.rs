use anyhow::{Context, Result};

use harbor_core::FlowStatus;
use harbor_node::config::NodeConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration first: it carries the log settings
    let config = NodeConfig::load().context("Failed to load configuration")?;

    harbor_monitoring::init(&config.monitoring()).context("Failed to initialize monitoring")?;

    let flow = harbor_node::run(config).await.context("Node error")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&flow.state).context("Failed to render flow state")?
    );
    harbor_monitoring::shutdown();

    match flow.state.status {
        FlowStatus::Success | FlowStatus::Stopped => Ok(()),
        status => anyhow::bail!("Flow {} ended with status {:?}", flow.id, status),
    }
}
