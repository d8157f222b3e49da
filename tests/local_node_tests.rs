/// Local Node Tests
///
/// Single-node behaviors that need no second peer: local publish/resolve,
/// descriptor signing through the node identity, and configuration-driven
/// construction.
use std::time::Duration;

use agentmesh::config::MeshConfig;
use agentmesh::content_id::compute_cid;
use agentmesh::error::MeshError;
use agentmesh::Node;

fn local_config() -> MeshConfig {
    let mut config = MeshConfig::default();
    config.network.listen_addresses = vec!["/ip4/127.0.0.1/tcp/0".to_string()];
    config
}

#[tokio::test]
async fn test_publish_then_local_resolve() {
    // DHT disabled: publish still stores locally and returns the CID.
    let node = Node::new(local_config()).await.unwrap();

    let bytes = b"local descriptor";
    let cid = node.publish(bytes).await.unwrap();
    assert_eq!(cid, compute_cid(bytes).to_string());

    let resolved = node.resolve(&cid).await.unwrap();
    assert_eq!(resolved, bytes.to_vec());

    let snapshot = node.metrics().snapshot();
    assert_eq!(snapshot.publishes, 1);
    assert_eq!(snapshot.resolve_local_hits, 1);

    node.close().await;
}

#[tokio::test]
async fn test_resolve_rejects_invalid_cid() {
    let node = Node::new(local_config()).await.unwrap();
    let err = node.resolve("not-a-cid").await.unwrap_err();
    assert!(matches!(err, MeshError::BadRequest(_)));
    node.close().await;
}

#[tokio::test]
async fn test_resolve_without_dht_is_a_network_error() {
    let node = Node::new(local_config()).await.unwrap();
    let missing = compute_cid(b"nowhere").to_string();
    // No local copy and no DHT to ask.
    let err = node.resolve(&missing).await.unwrap_err();
    assert!(matches!(err, MeshError::Network(_) | MeshError::Generic(_)));
    node.close().await;
}

#[tokio::test]
async fn test_descriptor_signing_through_node_identity() {
    let node = Node::new(local_config()).await.unwrap();

    let descriptor = format!(r#"{{"id":"{}","endpoints":[]}}"#, node.did());
    let envelope = node.sign_descriptor(descriptor.as_bytes()).unwrap();
    let peer = node.verify_descriptor(&envelope).unwrap();
    assert_eq!(peer, node.peer_id());

    // The wire format carries the documented field names.
    let json = serde_json::to_value(&envelope).unwrap();
    assert!(json.get("card").is_some());
    assert!(json.get("signature").is_some());
    assert!(json.get("timestamp").is_some());
    assert!(json.get("public_key").is_some());

    node.close().await;
}

#[tokio::test]
async fn test_descriptor_from_other_identity_fails() {
    let signer = Node::new(local_config()).await.unwrap();
    let other = Node::new(local_config()).await.unwrap();

    // Signer signs a card claiming the other node's DID.
    let descriptor = format!(r#"{{"id":"{}","endpoints":[]}}"#, other.did());
    let envelope = signer.sign_descriptor(descriptor.as_bytes()).unwrap();

    let err = signer.verify_descriptor(&envelope).unwrap_err();
    assert!(matches!(err, MeshError::Verification(_)));

    signer.close().await;
    other.close().await;
}

#[tokio::test]
async fn test_node_from_saved_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    let mut config = local_config();
    config.dedup.ttl_secs = 30;
    config.save(&path).unwrap();

    let loaded = MeshConfig::load_or_default(Some(path)).unwrap();
    assert_eq!(loaded.dedup.ttl_secs, 30);

    let node = Node::new(loaded).await.unwrap();
    assert!(node.did().starts_with("did:mesh:"));
    node.close().await;
}

#[tokio::test]
async fn test_concurrent_resolves_share_the_miss_path() {
    // With no providers, 20 concurrent resolves of one CID coalesce onto a
    // single provider lookup through the deduplicator.
    let mut config = local_config();
    config.dht.enabled = true;
    config.dht.server_mode = true;
    let node = std::sync::Arc::new(Node::new(config).await.unwrap());

    let missing = compute_cid(b"absent content").to_string();
    let mut handles = Vec::new();
    for _ in 0..20 {
        let node = std::sync::Arc::clone(&node);
        let cid = missing.clone();
        handles.push(tokio::spawn(async move { node.resolve(&cid).await }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_err());
    }

    node.close().await;
}

#[tokio::test]
async fn test_wait_for_peers_zero_is_immediate() {
    let node = Node::new(local_config()).await.unwrap();
    node.wait_for_peers(0, Duration::from_secs(1)).await.unwrap();
    node.close().await;
}
