//! Pinning and garbage collection over whole file DAGs.

use rhizome_core::chunker::ChunkerSpec;
use rhizome_core::dag::AddOptions;
use rhizome_core::unixfs;
use rhizome_core::{Collaborators, Node, NodeConfig};

async fn start_node(dir: &tempfile::TempDir) -> Node {
    let config = NodeConfig {
        repo_dir: dir.path().join("repo"),
        listen_port: 0,
        log_level: "warn".to_string(),
        bootstrap: Vec::new(),
        discovery_interval: 0,
    };
    Node::start(config, Collaborators::default()).await.unwrap()
}

#[tokio::test]
async fn test_recursive_pin_protects_closure() {
    let dir = tempfile::tempdir().unwrap();
    let node = start_node(&dir).await;

    let opts = AddOptions {
        chunker: ChunkerSpec::Size(32),
        pin: true,
        ..Default::default()
    };
    let payload = vec![0x7Au8; 400];
    let pinned = node.add_bytes(&payload, &opts).await.unwrap();
    let loose = node.add_text("collectable").await.unwrap();

    // Every reachable child carries a pin record
    let root = node.blocks().get(&pinned.cid).await.unwrap();
    let (_, links) = unixfs::decode_node(&root).unwrap();
    assert!(!links.is_empty());
    for link in &links {
        assert!(node.blocks().is_pinned(&link.cid).await);
    }

    let removed = node.blocks().garbage_collect().await.unwrap();
    assert_eq!(removed, 1, "only the unpinned root should go");
    assert_eq!(node.read_all_bytes(&pinned.cid).await.unwrap(), payload);
    assert!(!node.blocks().store().exists(&loose.cid).await);

    node.stop().await;
}

#[tokio::test]
async fn test_unpin_then_collect() {
    let dir = tempfile::tempdir().unwrap();
    let node = start_node(&dir).await;

    let opts = AddOptions {
        chunker: ChunkerSpec::Size(32),
        pin: true,
        ..Default::default()
    };
    let stat = node.add_bytes(&vec![0x55u8; 200], &opts).await.unwrap();
    assert_eq!(node.blocks().garbage_collect().await.unwrap(), 0);

    node.blocks().pin_remove(&stat.cid, true).await.unwrap();
    assert!(!node.blocks().is_pinned(&stat.cid).await);

    let removed = node.blocks().garbage_collect().await.unwrap();
    assert!(removed > 0);
    assert!(!node.blocks().store().exists(&stat.cid).await);

    node.stop().await;
}

#[tokio::test]
async fn test_direct_pin_does_not_protect_children() {
    let dir = tempfile::tempdir().unwrap();
    let node = start_node(&dir).await;

    let opts = AddOptions {
        chunker: ChunkerSpec::Size(16),
        ..Default::default()
    };
    let stat = node.add_bytes(&vec![0x42u8; 100], &opts).await.unwrap();
    node.blocks().pin_add(&stat.cid, false).await.unwrap();

    let removed = node.blocks().garbage_collect().await.unwrap();
    assert!(removed > 0, "children of a direct pin are collectable");
    assert!(node.blocks().store().exists(&stat.cid).await);

    node.stop().await;
}
