//! Two-node demo: import a file on one node, fetch it from the other.
//!
//! Run with: cargo run --example add_and_fetch

use rhizome_core::chunker::ChunkerSpec;
use rhizome_core::dag::AddOptions;
use rhizome_core::{Collaborators, Node, NodeConfig};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .init();

    let workdir = tempfile::tempdir()?;
    let mk_config = |name: &str| NodeConfig {
        repo_dir: workdir.path().join(name),
        listen_port: 0,
        log_level: "info".to_string(),
        bootstrap: Vec::new(),
        discovery_interval: 0,
    };

    let provider = Node::start(mk_config("provider"), Collaborators::default()).await?;
    let seeker = Node::start(mk_config("seeker"), Collaborators::default()).await?;

    // Import a chunked file on the provider
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let opts = AddOptions {
        chunker: ChunkerSpec::Size(16 * 1024),
        ..Default::default()
    };
    let stat = provider.add_bytes(&payload, &opts).await?;
    println!("provider imported {} bytes as {}", payload.len(), stat.cid);

    // Wait for the provider's listen address and connect the seeker to it
    let addr = loop {
        if let Some(addr) = provider.listen_addrs().await.into_iter().next() {
            break addr;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    println!("dialing {addr}");
    seeker.connect(addr);

    // The seeker pulls the whole DAG over the exchange protocol
    let fetched = tokio::time::timeout(
        Duration::from_secs(30),
        seeker.read_all_bytes(&stat.cid),
    )
    .await??;
    assert_eq!(fetched, payload);
    println!("seeker fetched {} bytes", fetched.len());

    if let Some(ledger) = seeker.exchange().ledger(&provider.peer_id()).await {
        println!(
            "ledger with provider: {} blocks, {} bytes received",
            ledger.blocks_exchanged, ledger.bytes_received
        );
    }

    provider.stop().await;
    seeker.stop().await;
    Ok(())
}
