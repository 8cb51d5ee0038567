//! Lista node binary
//!
//! A serverless shared-list daemon.

use lista_node::{ListaNode, NodeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lista_node=info,lista=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Lista node");

    let config = NodeConfig::from_env()?;
    std::fs::create_dir_all(&config.data_dir)?;

    let node = ListaNode::new(config)?;
    node.run().await?;

    Ok(())
}
