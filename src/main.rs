//! Rhizome - content-addressed peer-to-peer file system node

use rhizome_core::{Collaborators, Node, NodeConfig};
use std::error::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = NodeConfig::from_cli()?;
    init_logging(&config.log_level);

    tracing::info!("starting rhizome node");
    let node = Node::start(config, Collaborators::default()).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    node.stop().await;

    Ok(())
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
