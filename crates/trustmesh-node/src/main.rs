use anyhow::Result;

use trustmesh_node::{Node, NodeConfig, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let path = NodeConfig::default_path();
    let config = NodeConfig::load(&path)?;
    telemetry::init(&config.log)?;
    tracing::info!(config = %path.display(), backend = ?config.broker.backend, "Starting trustmesh node");

    let mut node = Node::build(config)?;
    node.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    node.shutdown().await;
    Ok(())
}
