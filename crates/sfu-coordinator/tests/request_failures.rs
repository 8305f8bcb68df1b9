//! Integration tests for rejected requests.
//!
//! Covers malformed frames, precondition failures, capacity limits and
//! media-engine faults (rejections, exhaustion, timeouts, cancellation).

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use common::types::{RoomId, TransportId};
use sfu_coordinator::actors::RegistrySettings;
use sfu_coordinator::errors::codes;
use sfu_coordinator::media::MediaKind;
use sfu_coordinator::signaling::{ClientMessage, ServerMessage};
use sfu_test_utils::{
    dtls_parameters, rtp_capabilities, Fault, MediaOp, MockMediaEngine, TestCoordinator,
    TEST_MEDIA_CALL_TIMEOUT,
};

const QUIET: Duration = Duration::from_millis(100);

#[tokio::test]
async fn test_malformed_frames_get_invalid_request_errors_in_order() {
    let coordinator = TestCoordinator::new();
    let mut peer = coordinator.connect();

    peer.send_raw("not json").await;
    peer.send_raw(r#"{"action":"teleport"}"#).await;
    peer.send_raw(r#"{"action":"joinRoom"}"#).await;
    peer.send_raw(r#"{"action":"joinRoom","roomId":"r"}"#).await;
    peer.send_raw(r#"{"noAction":true}"#).await;

    match peer.recv().await {
        ServerMessage::Error { request, code, .. } => {
            assert_eq!(request, None);
            assert_eq!(code, codes::INVALID_REQUEST);
        }
        other => panic!("expected error, got {other:?}"),
    }
    peer.expect_error("teleport", codes::INVALID_REQUEST).await;
    peer.expect_error("joinRoom", codes::INVALID_REQUEST).await;
    assert!(matches!(peer.recv().await, ServerMessage::RoomJoined { .. }));
    assert!(matches!(
        peer.recv().await,
        ServerMessage::Error {
            request: None,
            code: codes::INVALID_REQUEST,
            ..
        }
    ));

    // The session survives every bad frame.
    peer.router_capabilities().await;
}

#[tokio::test]
async fn test_requests_out_of_order_are_rejected() {
    let coordinator = TestCoordinator::new();
    let mut peer = coordinator.connect();

    for (message, request) in [
        (ClientMessage::GetRouterRtpCapabilities, "getRouterRtpCapabilities"),
        (ClientMessage::CreateSendTransport, "createSendTransport"),
        (ClientMessage::EndRoom, "endRoom"),
    ] {
        peer.send(message).await;
        peer.expect_error(request, codes::PRECONDITION_FAILED).await;
    }

    peer.join("r").await;

    peer.send(ClientMessage::JoinRoom {
        room_id: "other".to_string(),
    })
    .await;
    peer.expect_error("joinRoom", codes::PRECONDITION_FAILED).await;

    peer.send(ClientMessage::Produce {
        kind: MediaKind::Audio,
        rtp_parameters: sfu_test_utils::opus_rtp_parameters(),
    })
    .await;
    peer.expect_error("produce", codes::PRECONDITION_FAILED).await;

    peer.request_consume(rtp_capabilities()).await;
    peer.expect_error("consume", codes::PRECONDITION_FAILED).await;

    peer.open_send_transport().await;
    peer.send(ClientMessage::CreateSendTransport).await;
    peer.expect_error("createSendTransport", codes::CONFLICT).await;

    peer.send(ClientMessage::ConnectTransport {
        id: TransportId::from("transport-not-mine"),
        dtls_parameters: dtls_parameters(),
    })
    .await;
    peer.expect_error("connectTransport", codes::NOT_FOUND).await;
}

#[tokio::test]
async fn test_invalid_room_ids_are_rejected() {
    let coordinator = TestCoordinator::new();
    let mut peer = coordinator.connect();

    for room_id in [String::new(), "   ".to_string(), "x".repeat(1024)] {
        peer.send(ClientMessage::JoinRoom { room_id }).await;
        peer.expect_error("joinRoom", codes::INVALID_REQUEST).await;
    }
    assert_eq!(coordinator.status().await.room_count, 0);
}

#[tokio::test]
async fn test_room_and_server_capacity() {
    let settings = RegistrySettings {
        max_rooms: 1,
        max_peers_per_room: 2,
        ..RegistrySettings::default()
    };
    let coordinator =
        TestCoordinator::build(MockMediaEngine::healthy(), settings, TEST_MEDIA_CALL_TIMEOUT);

    let mut first = coordinator.connect();
    let mut second = coordinator.connect();
    let mut third = coordinator.connect();
    first.join("full").await;
    second.join("full").await;

    third.send(ClientMessage::JoinRoom {
        room_id: "full".to_string(),
    })
    .await;
    third.expect_error("joinRoom", codes::CAPACITY_EXCEEDED).await;

    third.send(ClientMessage::JoinRoom {
        room_id: "elsewhere".to_string(),
    })
    .await;
    third.expect_error("joinRoom", codes::CAPACITY_EXCEEDED).await;

    // A rejected peer is still free to join once there is room.
    second.disconnect().await;
    assert!(third.join("full").await.is_empty());
}

#[tokio::test]
async fn test_routing_context_exhaustion_is_a_capacity_error() {
    let engine = MockMediaEngine::builder()
        .fail_once(MediaOp::CreateRoutingContext, Fault::Exhausted)
        .build();
    let coordinator = TestCoordinator::with_engine(engine);
    let mut peer = coordinator.connect();

    peer.send(ClientMessage::JoinRoom {
        room_id: "r".to_string(),
    })
    .await;
    peer.expect_error("joinRoom", codes::CAPACITY_EXCEEDED).await;
    assert!(coordinator
        .registry
        .get_room(RoomId::parse("r").unwrap())
        .await
        .is_err());

    // The failure was for that call only.
    peer.join("r").await;
}

#[tokio::test]
async fn test_rejected_produce_publishes_nothing() {
    let engine = MockMediaEngine::builder()
        .fail_once(MediaOp::Produce, Fault::Reject("unsupported codec".into()))
        .build();
    let coordinator = TestCoordinator::with_engine(engine);
    let mut alice = coordinator.connect();
    let mut bob = coordinator.connect();
    alice.join("r").await;
    bob.join("r").await;
    alice.open_send_transport().await;

    alice.send(ClientMessage::Produce {
        kind: MediaKind::Audio,
        rtp_parameters: sfu_test_utils::opus_rtp_parameters(),
    })
    .await;
    let message = alice.expect_error("produce", codes::MEDIA_FAILURE).await;
    assert!(!message.contains("unsupported codec"), "engine detail leaked: {message}");
    bob.assert_silent(QUIET).await;

    // Retrying is left to the client and succeeds once the engine recovers.
    let flow = alice.produce(MediaKind::Audio).await;
    assert_eq!(bob.expect_new_producer().await.1, flow);
}

#[tokio::test]
async fn test_consume_failure_for_one_flow_does_not_block_the_rest() {
    let coordinator = TestCoordinator::new();
    let mut alice = coordinator.connect();
    let mut bob = coordinator.connect();
    alice.join("r").await;
    bob.join("r").await;
    let audio = alice.publish(MediaKind::Audio).await;
    let video = alice.produce(MediaKind::Video).await;
    bob.expect_new_producer().await;
    bob.expect_new_producer().await;
    bob.open_recv_transport().await;

    coordinator
        .engine
        .fail_next(MediaOp::Consume, Fault::Reject("decoder busy".into()));
    bob.request_consume(rtp_capabilities()).await;
    bob.expect_error("consume", codes::MEDIA_FAILURE).await;
    assert_eq!(bob.expect_consuming().await.flow_id, video);
    bob.assert_silent(QUIET).await;

    // The failed flow is picked up by the next consume.
    bob.request_consume(rtp_capabilities()).await;
    assert_eq!(bob.expect_consuming().await.flow_id, audio);
    assert_eq!(coordinator.engine.open_handles().await.consumers, 2);
}

#[tokio::test]
async fn test_consumer_exhaustion_is_a_capacity_error() {
    let coordinator = TestCoordinator::new();
    let mut alice = coordinator.connect();
    let mut bob = coordinator.connect();
    alice.join("r").await;
    bob.join("r").await;
    alice.publish(MediaKind::Audio).await;
    bob.expect_new_producer().await;
    bob.open_recv_transport().await;

    coordinator
        .engine
        .fail_next(MediaOp::Consume, Fault::Exhausted);
    bob.request_consume(rtp_capabilities()).await;
    bob.expect_error("consume", codes::CAPACITY_EXCEEDED).await;
    bob.assert_silent(QUIET).await;
}

#[tokio::test]
async fn test_hung_media_call_times_out() {
    let engine = MockMediaEngine::builder()
        .fail_once(MediaOp::CreateTransport, Fault::Hang)
        .build();
    let coordinator = TestCoordinator::build(
        engine,
        RegistrySettings::default(),
        Duration::from_millis(100),
    );
    let mut peer = coordinator.connect();
    peer.join("r").await;

    peer.send(ClientMessage::CreateSendTransport).await;
    peer.expect_error("createSendTransport", codes::MEDIA_FAILURE)
        .await;

    // Nothing was recorded for the timed-out call.
    assert!(!peer.snapshot().await.has_send_transport);
    peer.open_send_transport().await;
}

#[tokio::test]
async fn test_disconnect_cancels_in_flight_media_call() {
    let engine = MockMediaEngine::builder()
        .fail(MediaOp::Consume, Fault::Hang)
        .build();
    let coordinator = TestCoordinator::with_engine(engine);
    let mut alice = coordinator.connect();
    let mut bob = coordinator.connect();
    alice.join("r").await;
    bob.join("r").await;
    alice.publish(MediaKind::Audio).await;
    bob.expect_new_producer().await;
    bob.open_recv_transport().await;

    bob.request_consume(rtp_capabilities()).await;
    while coordinator.engine.calls(MediaOp::Consume) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Teardown completes well before the media call timeout.
    tokio::time::timeout(Duration::from_secs(1), bob.disconnect())
        .await
        .expect("disconnect blocked on the hung call");
    bob.assert_silent(QUIET).await;

    assert_eq!(
        alice.recv().await,
        ServerMessage::PeerDisconnected {
            peer_id: bob.peer_id()
        }
    );
    assert_eq!(coordinator.engine.open_handles().await.consumers, 0);
}
