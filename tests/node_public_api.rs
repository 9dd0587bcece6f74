//! Tests for the public Node API surface: handles, error reporting,
//! lifecycle, and cross-thread command ordering.

use std::time::Duration;

use pubmesh::{MeshError, Node};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn bind_assigns_ephemeral_port_and_identity() {
    let node = Node::bind("127.0.0.1:0").await.expect("bind failed");
    assert_ne!(node.local_addr().port(), 0);
    // Publisher id is a 16-byte identity, hex-encoded.
    assert_eq!(node.publisher_id().len(), 32);
    node.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn two_nodes_get_distinct_identities() {
    let a = Node::bind("127.0.0.1:0").await.expect("bind failed");
    let b = Node::bind("127.0.0.1:0").await.expect("bind failed");
    assert_ne!(a.publisher_id(), b.publisher_id());
    assert_ne!(a.local_addr(), b.local_addr());
}

#[tokio::test]
async fn publish_assigns_increasing_sequence_numbers() {
    let node = Node::bind("127.0.0.1:0").await.expect("bind failed");
    let first = node
        .publish(&["t"], b"1".to_vec(), 1, false)
        .await
        .expect("publish failed");
    let second = node
        .publish(&["t"], b"2".to_vec(), 1, false)
        .await
        .expect("publish failed");
    assert!(second.sequence > first.sequence);
    assert_eq!(first.publisher, second.publisher);
}

#[tokio::test]
async fn publish_without_topics_is_rejected() {
    let node = Node::bind("127.0.0.1:0").await.expect("bind failed");
    let err = node
        .publish(&[], Vec::new(), 1, false)
        .await
        .expect_err("topicless publish must fail");
    assert!(matches!(
        err.downcast_ref::<MeshError>(),
        Some(MeshError::Protocol(_))
    ));
}

#[tokio::test]
async fn subscribe_rejects_invalid_topics() {
    let node = Node::bind("127.0.0.1:0").await.expect("bind failed");

    let err = node.subscribe(&[]).await.expect_err("empty subscribe");
    assert!(matches!(
        err.downcast_ref::<MeshError>(),
        Some(MeshError::Protocol(_))
    ));

    let err = node.subscribe(&[""]).await.expect_err("empty topic name");
    assert!(matches!(
        err.downcast_ref::<MeshError>(),
        Some(MeshError::Protocol(_))
    ));
}

#[tokio::test]
async fn unsubscribe_unknown_handle_is_not_found() {
    let node = Node::bind("127.0.0.1:0").await.expect("bind failed");
    let (id, _rx) = node.subscribe(&["t"]).await.expect("subscribe failed");
    node.unsubscribe(id).await.expect("unsubscribe failed");

    let err = node
        .unsubscribe(id)
        .await
        .expect_err("double unsubscribe must fail");
    assert!(matches!(
        err.downcast_ref::<MeshError>(),
        Some(MeshError::NotFound)
    ));
}

#[tokio::test]
async fn unlink_unknown_handle_is_not_found() {
    let node = Node::bind("127.0.0.1:0").await.expect("bind failed");
    let err = node.unlink(9999).await.expect_err("unknown link");
    assert!(matches!(
        err.downcast_ref::<MeshError>(),
        Some(MeshError::NotFound)
    ));
}

#[tokio::test]
async fn ack_stream_can_be_taken_once() {
    let node = Node::bind("127.0.0.1:0").await.expect("bind failed");
    let _acks = node.acks().await.expect("first take");
    assert!(node.acks().await.is_err(), "second take must fail");
}

#[tokio::test]
async fn shutdown_resolves_and_stops_the_actor() {
    let node = Node::bind("127.0.0.1:0").await.expect("bind failed");
    timeout(TEST_TIMEOUT, node.shutdown())
        .await
        .expect("shutdown timeout")
        .expect("shutdown failed");

    // The destruction signal is the safe point; afterwards commands
    // report the actor as gone.
    assert!(node.publish(&["t"], Vec::new(), 1, false).await.is_err());
}

#[tokio::test]
async fn handles_are_cloneable_across_tasks() {
    let node = Node::bind("127.0.0.1:0").await.expect("bind failed");
    let (_id, mut rx) = node.subscribe(&["t"]).await.expect("subscribe failed");

    let publisher = node.clone();
    let task = tokio::spawn(async move {
        publisher
            .publish(&["t"], b"from task".to_vec(), 1, false)
            .await
            .expect("publish failed");
    });
    task.await.expect("task panicked");

    let publication = timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("delivery timeout")
        .expect("channel closed");
    assert_eq!(publication.payload, b"from task");
}

/// Operations submitted from one caller execute in submission order:
/// a subscribe issued before a publish sees that publish.
#[tokio::test]
async fn same_caller_operations_preserve_order() {
    let node = Node::bind("127.0.0.1:0").await.expect("bind failed");
    let (_id, mut rx) = node.subscribe(&["ordered"]).await.expect("subscribe failed");
    for i in 0..5u8 {
        node.publish(&["ordered"], vec![i], 1, false)
            .await
            .expect("publish failed");
    }
    for expected in 0..5u8 {
        let publication = timeout(TEST_TIMEOUT, rx.recv())
            .await
            .expect("delivery timeout")
            .expect("channel closed");
        assert_eq!(publication.payload, vec![expected]);
    }
}
