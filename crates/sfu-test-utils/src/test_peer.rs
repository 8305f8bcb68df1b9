//! Client-side driver for one peer session.
//!
//! [`TestPeer`] talks to a `PeerSessionActor` the way the WebSocket transport
//! does (decoded requests in, server messages out) without a socket, so tests
//! can assert on exact message order.

use common::types::{FlowId, PeerId};
use serde_json::Value;
use sfu_coordinator::actors::{
    PeerContext, PeerSessionActor, PeerSessionHandle, PeerSnapshot, SpawnedPeer,
};
use sfu_coordinator::media::MediaKind;
use sfu_coordinator::signaling::{
    decode_client_message, ClientMessage, ConsumerParams, FlowInfo, ServerMessage, TransportParams,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::fixtures::{dtls_parameters, opus_rtp_parameters, vp8_rtp_parameters};

/// How long `recv` waits before failing the test.
pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(2);

/// One connected test client.
pub struct TestPeer {
    handle: PeerSessionHandle,
    task: Option<JoinHandle<()>>,
    outbound: mpsc::Receiver<ServerMessage>,
}

impl TestPeer {
    /// Open a session against `context`.
    #[must_use]
    pub fn spawn(context: PeerContext) -> Self {
        let SpawnedPeer {
            handle,
            task,
            outbound,
        } = PeerSessionActor::spawn(PeerId::new(), context);
        Self {
            handle,
            task: Some(task),
            outbound,
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.handle.peer_id()
    }

    #[must_use]
    pub fn handle(&self) -> &PeerSessionHandle {
        &self.handle
    }

    /// Send a decoded request.
    pub async fn send(&self, message: ClientMessage) {
        self.handle
            .client_message(message)
            .await
            .expect("peer session stopped");
    }

    /// Send a raw text frame through the same decoding the transport uses.
    pub async fn send_raw(&self, frame: &str) {
        let result = match decode_client_message(frame) {
            Ok(message) => self.handle.client_message(message).await,
            Err(failure) => self.handle.malformed(failure).await,
        };
        result.expect("peer session stopped");
    }

    /// Next server message. Fails the test after [`MESSAGE_TIMEOUT`].
    pub async fn recv(&mut self) -> ServerMessage {
        match tokio::time::timeout(MESSAGE_TIMEOUT, self.outbound.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => panic!("outbound queue closed for peer {}", self.peer_id()),
            Err(_) => panic!("no message for peer {} within {MESSAGE_TIMEOUT:?}", self.peer_id()),
        }
    }

    /// Next server message if one arrives within `wait`.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<ServerMessage> {
        tokio::time::timeout(wait, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Fail if any message arrives within `wait`.
    pub async fn assert_silent(&mut self, wait: Duration) {
        if let Some(message) = self.recv_within(wait).await {
            panic!("peer {} received unexpected {message:?}", self.peer_id());
        }
    }

    /// Expect an `error` reply for `request` with `code`. Returns its message.
    pub async fn expect_error(&mut self, request: &str, code: i32) -> String {
        match self.recv().await {
            ServerMessage::Error {
                request: got_request,
                code: got_code,
                message,
            } => {
                assert_eq!(got_request.as_deref(), Some(request), "error for wrong request");
                assert_eq!(got_code, code, "unexpected error code: {message}");
                message
            }
            other => panic!("expected error for {request}, got {other:?}"),
        }
    }

    /// Join `room` and return the `existingFlows` of `roomJoined`.
    pub async fn join(&mut self, room: &str) -> Vec<FlowInfo> {
        self.send(ClientMessage::JoinRoom {
            room_id: room.to_string(),
        })
        .await;
        match self.recv().await {
            ServerMessage::RoomJoined {
                room_id,
                peer_id,
                existing_flows,
            } => {
                assert_eq!(room_id.as_str(), room);
                assert_eq!(peer_id, self.peer_id());
                existing_flows
            }
            other => panic!("expected roomJoined, got {other:?}"),
        }
    }

    pub async fn router_capabilities(&mut self) -> Value {
        self.send(ClientMessage::GetRouterRtpCapabilities).await;
        match self.recv().await {
            ServerMessage::RouterRtpCapabilities { capabilities } => capabilities,
            other => panic!("expected routerRtpCapabilities, got {other:?}"),
        }
    }

    /// Create and connect the send transport.
    pub async fn open_send_transport(&mut self) -> TransportParams {
        self.send(ClientMessage::CreateSendTransport).await;
        let params = match self.recv().await {
            ServerMessage::CreateSendTransport { params } => params,
            other => panic!("expected createSendTransport, got {other:?}"),
        };
        self.connect_transport(&params).await;
        params
    }

    /// Create and connect the receive transport.
    pub async fn open_recv_transport(&mut self) -> TransportParams {
        self.send(ClientMessage::CreateRecvTransport).await;
        let params = match self.recv().await {
            ServerMessage::CreateRecvTransport { params } => params,
            other => panic!("expected createRecvTransport, got {other:?}"),
        };
        self.connect_transport(&params).await;
        params
    }

    async fn connect_transport(&mut self, params: &TransportParams) {
        self.send(ClientMessage::ConnectTransport {
            id: params.id.clone(),
            dtls_parameters: dtls_parameters(),
        })
        .await;
        match self.recv().await {
            ServerMessage::TransportConnected { id } => assert_eq!(id, params.id),
            other => panic!("expected transportConnected, got {other:?}"),
        }
    }

    /// Publish one flow on the existing send transport.
    pub async fn produce(&mut self, kind: MediaKind) -> FlowId {
        let rtp_parameters = match kind {
            MediaKind::Audio => opus_rtp_parameters(),
            MediaKind::Video => vp8_rtp_parameters(),
        };
        self.send(ClientMessage::Produce {
            kind,
            rtp_parameters,
        })
        .await;
        match self.recv().await {
            ServerMessage::Produced { id } => id,
            other => panic!("expected produced, got {other:?}"),
        }
    }

    /// Open the send transport and publish one flow.
    pub async fn publish(&mut self, kind: MediaKind) -> FlowId {
        self.open_send_transport().await;
        self.produce(kind).await
    }

    /// Send `consume` without waiting for replies.
    pub async fn request_consume(&self, rtp_capabilities: Value) {
        self.send(ClientMessage::Consume { rtp_capabilities }).await;
    }

    /// Expect a `consuming` message.
    pub async fn expect_consuming(&mut self) -> ConsumerParams {
        match self.recv().await {
            ServerMessage::Consuming { params } => params,
            other => panic!("expected consuming, got {other:?}"),
        }
    }

    /// Expect a `newProducer` announcement.
    pub async fn expect_new_producer(&mut self) -> (PeerId, FlowId, MediaKind) {
        match self.recv().await {
            ServerMessage::NewProducer {
                owner_peer_id,
                flow_id,
                kind,
            } => (owner_peer_id, flow_id, kind),
            other => panic!("expected newProducer, got {other:?}"),
        }
    }

    pub async fn snapshot(&self) -> PeerSnapshot {
        self.handle.snapshot().await.expect("peer session stopped")
    }

    /// Close the connection and wait for teardown to finish.
    pub async fn disconnect(&mut self) {
        self.handle.close();
        if let Some(task) = self.task.take() {
            task.await.expect("peer session panicked");
        }
    }
}

impl Drop for TestPeer {
    fn drop(&mut self) {
        self.handle.close();
    }
}
