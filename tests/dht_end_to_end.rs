#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{make_node_id, test_config, NetworkRegistry, TestNode};
use mesh_dht::protocol::RpcRequest;
use mesh_dht::store::now_millis;
use mesh_dht::{hash_content, DhtError, DhtEvent, DhtNodeConfig, RpcHandler};
use tokio::time::timeout;

#[tokio::test]
async fn recursive_find_returns_expected_contacts() {
    let registry = Arc::new(NetworkRegistry::default());
    let main = TestNode::new(registry.clone(), 0x10, test_config()).await;
    let peer_one = TestNode::new(registry.clone(), 0x11, test_config()).await;
    let peer_two = TestNode::new(registry.clone(), 0x12, test_config()).await;

    main.node.observe_contact(peer_one.descriptor()).await;
    peer_one.node.observe_contact(peer_two.descriptor()).await;

    let results = main.node.find_closest_nodes(peer_two.id()).await;

    assert_eq!(results.first().map(|c| c.node_id), Some(peer_two.id()));
    assert!(results.iter().any(|c| c.node_id == peer_one.id()));
    assert!(results.iter().any(|c| c.node_id == main.id()));
    // learned during the lookup
    assert_eq!(main.node.routing_table_size().await, 2);
}

#[tokio::test]
async fn losing_failed_candidates_is_not_progress() {
    let registry = Arc::new(NetworkRegistry::default());
    let config = DhtNodeConfig {
        parallelism: 1,
        join_no_progress_limit: 2,
        ..test_config()
    };
    let searcher = TestNode::new(registry.clone(), 0x8000_0000, config).await;
    let mut peers = Vec::new();
    for index in 1..=6u32 {
        let peer = TestNode::new(registry.clone(), index, test_config()).await;
        searcher.node.observe_contact(peer.descriptor()).await;
        peers.push(peer);
    }
    for failing in &peers[..3] {
        searcher.network.set_failure(failing.id(), true).await;
    }

    searcher.node.find_closest_nodes(make_node_id(0)).await;

    let mut queried = 0;
    for peer in &peers {
        queried += searcher.network.calls_to(&peer.id(), "findNode").await;
    }
    // each failure moves the head of the list further away, so two rounds
    // without a closer contact end the lookup
    assert_eq!(queried, 2);
}

#[tokio::test]
async fn find_data_fetches_remote_entries() -> Result<()> {
    let registry = Arc::new(NetworkRegistry::default());
    let main = TestNode::new(registry.clone(), 0x20, test_config()).await;
    let holder = TestNode::new(registry.clone(), 0x21, test_config()).await;
    main.node.observe_contact(holder.descriptor()).await;

    let value = b"hello routing".to_vec();
    let key = hash_content(&value);
    holder
        .node
        .handle_request(
            &main.descriptor(),
            RpcRequest::StoreData {
                key,
                data: value.clone(),
                ttl_ms: 60_000,
                storer_time: now_millis(),
            },
        )
        .await?;

    let entries = main.node.find_data(key).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].data, value);
    assert_eq!(entries[0].storer.node_id, main.id());
    Ok(())
}

#[tokio::test]
async fn unreachable_peers_are_dropped_from_the_routing_table() {
    let registry = Arc::new(NetworkRegistry::default());
    let main = TestNode::new(registry.clone(), 0x30, test_config()).await;
    let peer = TestNode::new(registry.clone(), 0x31, test_config()).await;
    main.node.observe_contact(peer.descriptor()).await;

    main.network.set_failure(peer.id(), true).await;
    let results = main.node.find_closest_nodes(make_node_id(0xAA)).await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].node_id, main.id());
    assert_eq!(main.node.routing_table_size().await, 0);
}

#[tokio::test]
async fn stored_data_is_found_by_another_node() -> Result<()> {
    let registry = Arc::new(NetworkRegistry::default());
    let writer = TestNode::new(registry.clone(), 0x40, test_config()).await;
    let peer = TestNode::new(registry.clone(), 0x41, test_config()).await;
    writer.node.join_dht(&[peer.descriptor()]).await;

    let payload = b"end-to-end test".to_vec();
    let key = hash_content(&payload);
    let storers = writer.node.store_data_to_dht(key, payload.clone()).await?;
    assert_eq!(storers.len(), 2);

    let reader = TestNode::new(registry.clone(), 0x42, test_config()).await;
    reader.node.join_dht(&[peer.descriptor()]).await;

    let entries = reader.node.find_data(key).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].data, payload);
    assert!(!peer.node.local_entries(&key).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn external_clients_use_a_peer_as_proxy() -> Result<()> {
    let registry = Arc::new(NetworkRegistry::default());
    let proxy = TestNode::new(registry.clone(), 0x50, test_config()).await;
    let member = TestNode::new(registry.clone(), 0x51, test_config()).await;
    proxy.node.join_dht(&[member.descriptor()]).await;
    let client = TestNode::new(registry.clone(), 0x52, test_config()).await;

    let key = hash_content(b"external");
    let missing = client.node.find_data_via_peer(&proxy.descriptor(), key).await;
    assert!(matches!(missing, Err(DhtError::Remote(_))));

    let storers = client
        .node
        .store_data_via_peer(&proxy.descriptor(), key, b"external".to_vec())
        .await?;
    assert!(storers.iter().any(|s| s.node_id == proxy.id()));

    let entries = client.node.find_data_via_peer(&proxy.descriptor(), key).await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].data, b"external".to_vec());
    // the proxy stores under its own identity
    assert_eq!(entries[0].storer.node_id, proxy.id());
    Ok(())
}

#[tokio::test]
async fn routed_messages_reach_the_destination_over_two_hops() -> Result<()> {
    let registry = Arc::new(NetworkRegistry::default());
    let destination = TestNode::new(registry.clone(), 0x10, test_config()).await;
    let relay = TestNode::new(registry.clone(), 0x11, test_config()).await;
    let source = TestNode::new(registry.clone(), 0x80, test_config()).await;
    source.node.observe_contact(relay.descriptor()).await;
    relay.node.observe_contact(destination.descriptor()).await;
    let mut events = destination.node.subscribe();

    source
        .node
        .route_message(&destination.descriptor(), b"ping".to_vec())
        .await?;

    let delivered = timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Some(DhtEvent::Message(message)) => break Some(message),
                Some(_) => continue,
                None => break None,
            }
        }
    })
    .await?
    .expect("message event");
    assert_eq!(delivered.message, b"ping".to_vec());
    assert_eq!(delivered.source.node_id, source.id());
    assert!(delivered.routing_path.iter().any(|p| p.node_id == relay.id()));
    Ok(())
}

#[tokio::test]
async fn routing_without_closer_contacts_fails() {
    let registry = Arc::new(NetworkRegistry::default());
    let lonely = TestNode::new(registry.clone(), 0x60, test_config()).await;
    let target = TestNode::new(registry.clone(), 0x61, test_config()).await;

    let result = lonely.node.route_message(&target.descriptor(), b"x".to_vec()).await;
    assert!(matches!(result, Err(DhtError::Unreachable(_))));
}

#[tokio::test]
async fn forwarded_messages_enter_the_overlay_through_the_given_peer() -> Result<()> {
    let registry = Arc::new(NetworkRegistry::default());
    let destination = TestNode::new(registry.clone(), 0x10, test_config()).await;
    let via = TestNode::new(registry.clone(), 0x11, test_config()).await;
    let outsider = TestNode::new(registry.clone(), 0x90, test_config()).await;
    via.node.observe_contact(destination.descriptor()).await;
    let mut events = destination.node.subscribe();

    outsider
        .node
        .forward_message(&via.descriptor(), &destination.descriptor(), b"fwd".to_vec())
        .await?;

    let delivered = timeout(Duration::from_secs(1), async {
        loop {
            if let Some(DhtEvent::Message(message)) = events.recv().await {
                break message;
            }
        }
    })
    .await?;
    assert_eq!(delivered.message, b"fwd".to_vec());
    assert_eq!(delivered.source.node_id, outsider.id());
    Ok(())
}
