//! Integration tests for the `/ws` signaling protocol.
//!
//! Each test runs a real server backed by the local media engine and drives
//! it with one or more `SignalingClient`s.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use cast_test_utils::fixtures;
use cast_test_utils::{SignalingClient, TestCastServer};
use common::types::{MediaKind, TransportDirection};
use serde_json::{json, Value};
use std::time::Duration;

const QUIET_PERIOD: Duration = Duration::from_millis(200);
const UNKNOWN_ID: &str = "00000000-0000-4000-8000-000000000000";

#[tokio::test]
async fn test_connect_greets_with_session_id() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;

    let alice = server.connect("alice").await?;

    assert!(!alice.session_id().is_empty());
    assert!(server.wait_until(|s| s.state().supervisor.session_count() == 1).await);
    Ok(())
}

#[tokio::test]
async fn test_rtp_capabilities_list_router_codecs() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut alice = server.connect("alice").await?;

    let caps = alice.request("get-rtp-capabilities", Value::Null).await.unwrap();

    let mimes: Vec<&str> = caps["codecs"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|c| c["mimeType"].as_str())
        .collect();
    assert!(mimes.contains(&"audio/opus"));
    assert!(mimes.contains(&"video/VP8"));
    Ok(())
}

#[tokio::test]
async fn test_create_and_connect_transport() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut alice = server.connect("alice").await?;

    let transport_id = alice.create_transport(TransportDirection::Send).await.unwrap();
    assert!(!transport_id.is_empty());

    let connected = alice.connect_transport(&transport_id).await.unwrap();
    assert_eq!(connected["transportId"], transport_id);
    assert_eq!(server.engine().transport_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_connect_unknown_transport_is_not_found() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut alice = server.connect("alice").await?;

    let err = alice.connect_transport(UNKNOWN_ID).await.unwrap_err();

    assert_eq!(err.code, "NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn test_cannot_use_another_sessions_transport() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut alice = server.connect("alice").await?;
    let mut bob = server.connect("bob").await?;

    let alice_transport = alice.create_transport(TransportDirection::Send).await.unwrap();
    let err = bob.connect_transport(&alice_transport).await.unwrap_err();

    assert_eq!(err.code, "NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn test_produce_announces_to_others_only() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut alice = server.connect("alice").await?;
    let mut bob = server.connect("bob").await?;

    let producer_id = alice.publish(MediaKind::Audio).await.unwrap();

    let announced = bob.expect_event("new-producer").await.unwrap();
    assert_eq!(announced["id"], producer_id);
    assert_eq!(announced["kind"], "audio");
    assert_eq!(announced["appData"]["username"], "alice");
    assert_eq!(announced["appData"]["clientId"], alice.session_id());

    assert!(
        alice.no_event_within(QUIET_PERIOD).await,
        "Producer should not be told about its own stream"
    );
    Ok(())
}

#[tokio::test]
async fn test_produce_on_receive_transport_is_rejected() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut alice = server.connect("alice").await?;
    let recv = alice.create_transport(TransportDirection::Recv).await.unwrap();

    let err = alice
        .request(
            "produce",
            json!({
                "transportId": recv,
                "kind": "audio",
                "rtpParameters": fixtures::opus_rtp_parameters(),
            }),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code, "INVALID_REQUEST");
    assert_eq!(server.engine().producer_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_existing_producers_for_late_joiner() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut alice = server.connect("alice").await?;
    let audio = alice.publish(MediaKind::Audio).await.unwrap();
    let video = alice.publish(MediaKind::Video).await.unwrap();

    let mut carol = server.connect("carol").await?;
    let existing = carol.request("get-existing-producers", Value::Null).await.unwrap();

    let mut ids: Vec<String> = existing
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap().to_string())
        .collect();
    ids.sort();
    let mut expected = vec![audio, video];
    expected.sort();
    assert_eq!(ids, expected);
    Ok(())
}

#[tokio::test]
async fn test_consume_returns_consumer_for_producer() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut alice = server.connect("alice").await?;
    let mut bob = server.connect("bob").await?;
    let producer_id = alice.publish(MediaKind::Video).await.unwrap();

    let consumer = bob.subscribe(&producer_id).await.unwrap();

    assert_eq!(consumer["producerId"], producer_id);
    assert_eq!(consumer["kind"], "video");
    assert_eq!(
        consumer["rtpParameters"]["codecs"][0]["mimeType"],
        "video/VP8"
    );
    assert_eq!(server.engine().consumer_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_consume_with_incompatible_capabilities() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut alice = server.connect("alice").await?;
    let mut bob = server.connect("bob").await?;
    let producer_id = alice.publish(MediaKind::Video).await.unwrap();
    let recv = bob.create_transport(TransportDirection::Recv).await.unwrap();

    let err = bob
        .request(
            "consume",
            json!({
                "transportId": recv,
                "producerId": producer_id,
                "rtpCapabilities": fixtures::h264_only_capabilities(),
            }),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code, "INCOMPATIBLE_CAPABILITIES");
    assert_eq!(server.engine().consumer_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_consume_unknown_producer_is_not_found() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut bob = server.connect("bob").await?;

    let err = bob.subscribe(UNKNOWN_ID).await.unwrap_err();

    assert_eq!(err.code, "NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn test_disconnect_closes_producers_and_dependent_consumers() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut alice = server.connect("alice").await?;
    let mut bob = server.connect("bob").await?;
    let producer_id = alice.publish(MediaKind::Audio).await.unwrap();
    bob.subscribe(&producer_id).await.unwrap();
    assert_eq!(server.engine().consumer_count(), 1);

    alice.close().await;

    let closed = bob.expect_event("producer-closed").await.unwrap();
    assert_eq!(closed["producerId"], producer_id);
    assert!(
        server
            .wait_until(|s| s.engine().producer_count() == 0
                && s.engine().consumer_count() == 0
                && s.state().supervisor.session_count() == 1)
            .await,
        "Alice's producer and Bob's consumer of it should be gone"
    );

    // Bob's own transport survives
    assert_eq!(server.engine().transport_count(), 1);
    let existing = bob.request("get-existing-producers", Value::Null).await.unwrap();
    assert_eq!(existing, json!([]));
    Ok(())
}

/// Ids of the `new-producer` events that arrive before the connection goes quiet.
async fn announced_producers(client: &mut SignalingClient) -> Vec<String> {
    let mut ids = Vec::new();
    while !client.no_event_within(QUIET_PERIOD).await {
        let event = client.next_event().await.unwrap();
        if event["event"] == "new-producer" {
            ids.push(event["data"]["id"].as_str().unwrap().to_string());
        }
    }
    ids
}

#[tokio::test]
async fn test_each_produce_is_announced_once_per_peer() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut alice = server.connect("alice").await?;
    let mut bob = server.connect("bob").await?;
    let mut carol = server.connect("carol").await?;
    let mut dave = server.connect("dave").await?;

    let published = vec![
        alice.publish(MediaKind::Audio).await.unwrap(),
        alice.publish(MediaKind::Video).await.unwrap(),
        alice.publish(MediaKind::Video).await.unwrap(),
    ];

    for peer in [&mut bob, &mut carol, &mut dave] {
        assert_eq!(announced_producers(peer).await, published);
    }
    assert!(announced_producers(&mut alice).await.is_empty());

    // A second producer's stream reaches everyone but that producer
    let from_bob = bob.publish(MediaKind::Audio).await.unwrap();
    for peer in [&mut alice, &mut carol, &mut dave] {
        assert_eq!(announced_producers(peer).await, vec![from_bob.clone()]);
    }
    assert!(announced_producers(&mut bob).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_transport_with_several_producers_closes_each_once() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut alice = server.connect("alice").await?;
    let mut bob = server.connect("bob").await?;
    let mut carol = server.connect("carol").await?;

    let mut published = vec![
        alice.publish(MediaKind::Audio).await.unwrap(),
        alice.publish(MediaKind::Video).await.unwrap(),
    ];
    for producer_id in &published {
        bob.subscribe(producer_id).await.unwrap();
        carol.subscribe(producer_id).await.unwrap();
    }
    assert_eq!(server.engine().producer_count(), 2);
    assert_eq!(server.engine().consumer_count(), 4);
    assert_eq!(server.engine().transport_count(), 3);

    alice.close().await;

    published.sort();
    for peer in [&mut bob, &mut carol] {
        let mut closed = Vec::new();
        while !peer.no_event_within(QUIET_PERIOD).await {
            let event = peer.next_event().await.unwrap();
            if event["event"] == "producer-closed" {
                closed.push(event["data"]["producerId"].as_str().unwrap().to_string());
            }
        }
        closed.sort();
        assert_eq!(closed, published);
    }
    assert!(
        server
            .wait_until(|s| s.engine().producer_count() == 0
                && s.engine().consumer_count() == 0
                && s.engine().transport_count() == 2)
            .await,
        "Both producers and all four consumers of them should be gone"
    );
    Ok(())
}

#[tokio::test]
async fn test_unknown_method_keeps_connection_open() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut alice = server.connect("alice").await?;

    let err = alice.request("teleport", json!({})).await.unwrap_err();
    assert_eq!(err.code, "INVALID_REQUEST");

    let caps = alice.request("get-rtp-capabilities", Value::Null).await;
    assert!(caps.is_ok(), "Connection should survive an unknown method");
    Ok(())
}

#[tokio::test]
async fn test_malformed_frame_closes_connection() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut alice = server.connect("alice").await?;

    alice.send_raw("{not json").await;

    assert!(alice.is_closed_by_server().await);
    assert!(server.wait_until(|s| s.state().supervisor.session_count() == 0).await);
    Ok(())
}

#[tokio::test]
async fn test_username_defaults_when_missing() -> Result<(), anyhow::Error> {
    let server = TestCastServer::spawn().await?;
    let mut anonymous = SignalingClient::connect(&format!("ws://{}/ws", server.addr())).await?;
    let mut bob = server.connect("bob").await?;

    anonymous.publish(MediaKind::Audio).await.unwrap();

    let announced = bob.expect_event("new-producer").await.unwrap();
    assert_eq!(announced["appData"]["username"], "Anonymous");
    Ok(())
}
