use clap::Parser;

use spool_server::{start_node, NodeArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = NodeArgs::parse();
    let config = args.into_config()?;
    let node = start_node(config).await?;
    tracing::info!(addr = %node.addr(), "spool listening");
    node.run().await
}
