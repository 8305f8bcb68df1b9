//! End-to-end tests over a real WebSocket.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sfu_coordinator::errors::codes;
use sfu_coordinator::transport::{signaling_router, SignalingState};
use sfu_test_utils::TestCoordinator;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve(coordinator: &TestCoordinator) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = signaling_router(SignalingState::new(coordinator.context.clone()));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    client
}

async fn send(client: &mut Client, frame: Value) {
    client.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next text frame as JSON, skipping control frames.
async fn recv(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("no frame within 2s")
            .expect("socket closed")
            .unwrap();
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

async fn join(client: &mut Client, room: &str) -> Value {
    send(client, json!({ "action": "joinRoom", "roomId": room })).await;
    let reply = recv(client).await;
    assert_eq!(reply["action"], "roomJoined");
    assert_eq!(reply["roomId"], room);
    reply
}

#[tokio::test]
async fn test_join_and_capabilities_over_websocket() {
    let coordinator = TestCoordinator::new();
    let addr = serve(&coordinator).await;
    let mut client = connect(addr).await;

    let joined = join(&mut client, "lobby").await;
    assert_eq!(joined["existingFlows"], json!([]));
    assert!(joined["peerId"].is_string());

    send(&mut client, json!({ "action": "getRouterRtpCapabilities" })).await;
    let reply = recv(&mut client).await;
    assert_eq!(reply["action"], "routerRtpCapabilities");
    assert!(reply["capabilities"]["codecs"].is_array());
}

#[tokio::test]
async fn test_bad_frames_are_answered_without_closing() {
    let coordinator = TestCoordinator::new();
    let addr = serve(&coordinator).await;
    let mut client = connect(addr).await;

    client
        .send(Message::Text("{ not json".to_string()))
        .await
        .unwrap();
    let reply = recv(&mut client).await;
    assert_eq!(reply["action"], "error");
    assert_eq!(reply["code"], codes::INVALID_REQUEST);
    assert!(reply.get("request").is_none());

    send(&mut client, json!({ "action": "selfDestruct" })).await;
    let reply = recv(&mut client).await;
    assert_eq!(reply["request"], "selfDestruct");
    assert_eq!(reply["code"], codes::INVALID_REQUEST);

    client
        .send(Message::Binary(vec![0xff, 0xfe, 0xfd]))
        .await
        .unwrap();
    let reply = recv(&mut client).await;
    assert_eq!(reply["code"], codes::INVALID_REQUEST);

    // UTF-8 JSON in a binary frame is accepted.
    let frame = json!({ "action": "joinRoom", "roomId": "bin" }).to_string();
    client.send(Message::Binary(frame.into_bytes())).await.unwrap();
    assert_eq!(recv(&mut client).await["action"], "roomJoined");
}

#[tokio::test]
async fn test_socket_close_tears_the_session_down() {
    let coordinator = TestCoordinator::new();
    let addr = serve(&coordinator).await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    let alice_id = join(&mut alice, "r1").await["peerId"].clone();
    join(&mut bob, "r1").await;

    alice.close(None).await.unwrap();

    let notice = recv(&mut bob).await;
    assert_eq!(notice["action"], "peerDisconnected");
    assert_eq!(notice["peerId"], alice_id);

    bob.close(None).await.unwrap();

    // Removal happens after the socket closes; poll for it.
    tokio::time::timeout(Duration::from_secs(2), async {
        while coordinator.status().await.room_count != 0
            || coordinator.metrics.connection_count() != 0
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room and connections not released");
}
