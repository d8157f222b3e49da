/// Network Integration Tests
///
/// Multi-node scenarios exercising the full stack: two real nodes on
/// loopback TCP, Kademlia provider discovery, content exchange, tamper
/// detection, gossip-backed agent messaging and direct Q-routing sends.
/// Timings are deliberately generous; loopback is fast but mesh formation
/// and DHT propagation are not instant.
use std::sync::Arc;
use std::time::Duration;

use agentmesh::config::MeshConfig;
use agentmesh::content_id::compute_cid;
use agentmesh::error::{MeshError, VerificationFault};
use agentmesh::message_bus::MessageType;
use agentmesh::Node;

fn test_config(bootstrap: Vec<String>) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.network.listen_addresses = vec!["/ip4/127.0.0.1/tcp/0".to_string()];
    config.network.bootstrap_peers = bootstrap;
    config.dht.enabled = true;
    config.dht.server_mode = true;
    config
}

async fn spawn_node(bootstrap: Vec<String>) -> Node {
    Node::new(test_config(bootstrap)).await.expect("node construction")
}

/// Wait until the node reports a listen address, returning its full
/// `/p2p/`-qualified multiaddr.
async fn dialable_address(node: &Node) -> String {
    for _ in 0..100 {
        if let Ok(addresses) = node.listen_addresses().await {
            if let Some(address) = addresses.first() {
                return format!("{}/p2p/{}", address, node.peer_id());
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("node never started listening");
}

#[tokio::test]
async fn test_publish_resolve_round_trip() {
    let publisher = spawn_node(vec![]).await;
    let publisher_addr = dialable_address(&publisher).await;

    let bytes = b"hello world";
    let cid = publisher.publish(bytes).await.unwrap();
    assert_eq!(cid, compute_cid(bytes).to_string());

    // A node that never bootstrapped has no route to the content.
    let isolated = spawn_node(vec![]).await;
    let err = isolated.resolve(&cid).await.unwrap_err();
    assert!(matches!(err, MeshError::NotFound(_)), "got {:?}", err);
    isolated.close().await;

    // After bootstrapping through the publisher the content resolves.
    let resolver = spawn_node(vec![publisher_addr]).await;
    resolver.bootstrap().await.unwrap();
    resolver
        .wait_for_peers(1, Duration::from_secs(10))
        .await
        .unwrap();

    let mut resolved = None;
    for _ in 0..30 {
        match resolver.resolve(&cid).await {
            Ok(bytes) => {
                resolved = Some(bytes);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }
    assert_eq!(resolved.expect("resolve within deadline"), bytes.to_vec());

    // Second resolve is a local store hit.
    let before = resolver.metrics().snapshot().resolve_local_hits;
    resolver.resolve(&cid).await.unwrap();
    assert_eq!(resolver.metrics().snapshot().resolve_local_hits, before + 1);

    resolver.close().await;
    publisher.close().await;
}

#[tokio::test]
async fn test_tampered_content_is_rejected() {
    // A malicious provider advertises cid_a but serves different bytes.
    let genuine = b"bytes_A".to_vec();
    let tampered = b"bytes_Ax".to_vec();
    let cid_a = compute_cid(&genuine);

    let malicious = spawn_node(vec![]).await;
    let malicious_addr = dialable_address(&malicious).await;
    malicious.store().put(&cid_a, tampered).await.unwrap();
    malicious
        .refresher()
        .expect("dht enabled")
        .provide(cid_a)
        .await
        .unwrap();

    let client = spawn_node(vec![malicious_addr]).await;
    client.bootstrap().await.unwrap();
    client
        .wait_for_peers(1, Duration::from_secs(10))
        .await
        .unwrap();

    let mut last_err = None;
    for _ in 0..30 {
        match client.resolve(&cid_a.to_string()).await {
            Err(MeshError::NotFound(_)) => {
                // Provider record not visible yet.
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            other => {
                last_err = Some(other);
                break;
            }
        }
    }

    let err = last_err
        .expect("provider became visible")
        .expect_err("tampered bytes must not resolve");
    assert!(
        err.is_verification(&VerificationFault::HashMismatch),
        "got {:?}",
        err
    );

    // The tampered bytes were never stored locally.
    assert!(!client.store().has(&cid_a).await);

    // The offending peer took a negative score update.
    let entry = client
        .qtable()
        .get(&malicious.peer_id())
        .await
        .expect("qtable entry for the failing peer");
    assert!(entry.score < 0.0, "score = {}", entry.score);

    assert!(client.metrics().snapshot().verification_failures >= 1);

    client.close().await;
    malicious.close().await;
}

#[tokio::test]
async fn test_handshake_between_compatible_nodes() {
    let server = spawn_node(vec![]).await;
    let server_addr = dialable_address(&server).await;

    let client = spawn_node(vec![server_addr]).await;
    client.bootstrap().await.unwrap();
    client
        .wait_for_peers(1, Duration::from_secs(10))
        .await
        .unwrap();

    client.handshake_with(server.peer_id()).await.unwrap();

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_agent_message_request_response() {
    let server = spawn_node(vec![]).await;
    let server_addr = dialable_address(&server).await;

    let client = spawn_node(vec![server_addr]).await;
    client.bootstrap().await.unwrap();
    client
        .wait_for_peers(1, Duration::from_secs(10))
        .await
        .unwrap();

    // The server echoes every request payload back.
    let responder_bus = Arc::clone(server.bus());
    server
        .bus()
        .register_handler(
            MessageType::Request,
            Arc::new(move |message| {
                let bus = Arc::clone(&responder_bus);
                tokio::spawn(async move {
                    let _ = bus.send_response(&message, message.payload.clone(), "echo").await;
                });
                Ok(())
            }),
        )
        .await;

    // The gossipsub mesh needs a moment; retry until the publish goes out.
    let server_id = server.peer_id().to_string();
    let mut response = None;
    for _ in 0..30 {
        match client
            .bus()
            .send_request(&server_id, b"ping".to_vec(), "text", Duration::from_secs(5))
            .await
        {
            Ok(message) => {
                response = Some(message);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }

    let response = response.expect("request answered within deadline");
    assert_eq!(response.payload, b"ping");
    assert_eq!(response.message_type, MessageType::Response);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_direct_send_feeds_qtable() {
    let receiver = spawn_node(vec![]).await;
    let receiver_addr = dialable_address(&receiver).await;

    let sender = spawn_node(vec![receiver_addr]).await;
    sender.bootstrap().await.unwrap();
    sender
        .wait_for_peers(1, Duration::from_secs(10))
        .await
        .unwrap();

    let mut inbound = receiver.take_direct_messages().await.expect("first take");

    let target = sender
        .send_direct(&[receiver.peer_id()], b"route me")
        .await
        .unwrap();
    assert_eq!(target, receiver.peer_id());

    let (from, bytes) =
        tokio::time::timeout(Duration::from_secs(10), inbound.recv())
            .await
            .unwrap()
            .unwrap();
    assert_eq!(from, sender.peer_id());
    assert_eq!(bytes, b"route me");

    // Both directions observed the interaction.
    let sender_view = sender.qtable().get(&receiver.peer_id()).await.unwrap();
    assert!(sender_view.score > 0.0);
    let receiver_view = receiver.qtable().get(&sender.peer_id()).await.unwrap();
    assert!(receiver_view.score > 0.0);

    sender.close().await;
    receiver.close().await;
}

#[tokio::test]
async fn test_descriptor_updates_propagate_causally() {
    let origin = spawn_node(vec![]).await;
    let origin_addr = dialable_address(&origin).await;

    let follower = spawn_node(vec![origin_addr]).await;
    follower.bootstrap().await.unwrap();
    follower
        .wait_for_peers(1, Duration::from_secs(10))
        .await
        .unwrap();

    let did = origin.did();

    // The gossip mesh needs a moment; retry until the announce goes out.
    let mut published = false;
    for _ in 0..30 {
        if origin
            .publish_descriptor_update(&did, b"endpoints-v1".to_vec())
            .await
            .is_ok()
        {
            published = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert!(published, "announce never left the origin");

    let mut latest = None;
    for _ in 0..30 {
        if let Some(update) = follower.latest_descriptor_update(&did).await {
            latest = Some(update);
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    let update = latest.expect("update reached the follower");
    assert_eq!(update.payload, b"endpoints-v1");
    assert_eq!(update.updater_id, origin.peer_id().to_string());
    assert_eq!(follower.descriptor_conflicts(&did).await, 0);

    follower.close().await;
    origin.close().await;
}

#[tokio::test]
async fn test_wait_for_peers_times_out_alone() {
    let node = spawn_node(vec![]).await;
    let err = node
        .wait_for_peers(1, Duration::from_millis(600))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::DeadlineExceeded(_)));
    node.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let node = spawn_node(vec![]).await;
    node.close().await;
    node.close().await;
    // The store is closed as part of shutdown.
    assert!(node.store().get(&compute_cid(b"x")).await.is_err());
}
