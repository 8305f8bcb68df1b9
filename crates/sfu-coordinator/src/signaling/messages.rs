//! Signaling protocol messages.
//!
//! Every frame is a JSON object with an `action` discriminator; payload fields
//! use camelCase.

use crate::errors::SfuError;
use crate::media::{ConsumerHandle, MediaKind, TransportDescriptor};
use common::types::{ConsumerId, FlowId, PeerId, RoomId, TransportId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client → coordinator requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
    },
    GetRouterRtpCapabilities,
    CreateSendTransport,
    CreateRecvTransport,
    ConnectTransport {
        id: TransportId,
        dtls_parameters: Value,
    },
    Produce {
        kind: MediaKind,
        rtp_parameters: Value,
    },
    Consume {
        rtp_capabilities: Value,
    },
    EndRoom,
}

impl ClientMessage {
    /// Every `action` value a client may send.
    pub const ACTIONS: [&'static str; 8] = [
        "joinRoom",
        "getRouterRtpCapabilities",
        "createSendTransport",
        "createRecvTransport",
        "connectTransport",
        "produce",
        "consume",
        "endRoom",
    ];

    /// Wire name of the action, used in replies, logs and metric labels.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "joinRoom",
            ClientMessage::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            ClientMessage::CreateSendTransport => "createSendTransport",
            ClientMessage::CreateRecvTransport => "createRecvTransport",
            ClientMessage::ConnectTransport { .. } => "connectTransport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::EndRoom => "endRoom",
        }
    }
}

/// A published flow as advertised to other peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowInfo {
    pub flow_id: FlowId,
    pub owner_peer_id: PeerId,
    pub kind: MediaKind,
}

/// Transport parameters the client needs to build its local transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

impl From<&TransportDescriptor> for TransportParams {
    fn from(transport: &TransportDescriptor) -> Self {
        Self {
            id: transport.id.clone(),
            ice_parameters: transport.ice_parameters.clone(),
            ice_candidates: transport.ice_candidates.clone(),
            dtls_parameters: transport.dtls_parameters.clone(),
        }
    }
}

/// Parameters of one new consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub flow_id: FlowId,
    pub owner_peer_id: PeerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

impl ConsumerParams {
    #[must_use]
    pub fn new(consumer: &ConsumerHandle, owner_peer_id: PeerId) -> Self {
        Self {
            id: consumer.id.clone(),
            flow_id: consumer.flow_id.clone(),
            owner_peer_id,
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters.clone(),
        }
    }
}

/// Coordinator → client messages: replies, broadcasts and errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    RoomJoined {
        room_id: RoomId,
        peer_id: PeerId,
        existing_flows: Vec<FlowInfo>,
    },
    RouterRtpCapabilities {
        capabilities: Value,
    },
    CreateSendTransport {
        params: TransportParams,
    },
    CreateRecvTransport {
        params: TransportParams,
    },
    TransportConnected {
        id: TransportId,
    },
    Produced {
        id: FlowId,
    },
    Consuming {
        params: ConsumerParams,
    },
    NewProducer {
        owner_peer_id: PeerId,
        flow_id: FlowId,
        kind: MediaKind,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    RoomEnded {
        room_id: RoomId,
    },
    Error {
        /// Action of the rejected request, when it could be read.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<String>,
        code: i32,
        message: String,
    },
}

impl ServerMessage {
    /// `error` reply for a rejected request.
    #[must_use]
    pub fn rejection(request: Option<&str>, error: &SfuError) -> Self {
        ServerMessage::Error {
            request: request.map(str::to_string),
            code: error.error_code(),
            message: error.client_message(),
        }
    }

    /// Wire name of the message, for logs.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            ServerMessage::RoomJoined { .. } => "roomJoined",
            ServerMessage::RouterRtpCapabilities { .. } => "routerRtpCapabilities",
            ServerMessage::CreateSendTransport { .. } => "createSendTransport",
            ServerMessage::CreateRecvTransport { .. } => "createRecvTransport",
            ServerMessage::TransportConnected { .. } => "transportConnected",
            ServerMessage::Produced { .. } => "produced",
            ServerMessage::Consuming { .. } => "consuming",
            ServerMessage::NewProducer { .. } => "newProducer",
            ServerMessage::PeerDisconnected { .. } => "peerDisconnected",
            ServerMessage::RoomEnded { .. } => "roomEnded",
            ServerMessage::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages_parse_from_wire() {
        let join: ClientMessage =
            serde_json::from_value(json!({ "action": "joinRoom", "roomId": "r1" })).unwrap();
        assert_eq!(
            join,
            ClientMessage::JoinRoom {
                room_id: "r1".to_string()
            }
        );

        let caps: ClientMessage =
            serde_json::from_value(json!({ "action": "getRouterRtpCapabilities" })).unwrap();
        assert_eq!(caps, ClientMessage::GetRouterRtpCapabilities);

        let connect: ClientMessage = serde_json::from_value(json!({
            "action": "connectTransport",
            "id": "t-1",
            "dtlsParameters": { "role": "client" }
        }))
        .unwrap();
        assert_eq!(connect.action(), "connectTransport");

        let produce: ClientMessage = serde_json::from_value(json!({
            "action": "produce",
            "kind": "video",
            "rtpParameters": { "codecs": [] }
        }))
        .unwrap();
        assert!(matches!(
            produce,
            ClientMessage::Produce {
                kind: MediaKind::Video,
                ..
            }
        ));
    }

    #[test]
    fn test_action_names_match_wire_tags() {
        let messages = [
            ClientMessage::JoinRoom {
                room_id: "r".to_string(),
            },
            ClientMessage::GetRouterRtpCapabilities,
            ClientMessage::CreateSendTransport,
            ClientMessage::CreateRecvTransport,
            ClientMessage::ConnectTransport {
                id: TransportId::from("t"),
                dtls_parameters: Value::Null,
            },
            ClientMessage::Produce {
                kind: MediaKind::Audio,
                rtp_parameters: Value::Null,
            },
            ClientMessage::Consume {
                rtp_capabilities: Value::Null,
            },
            ClientMessage::EndRoom,
        ];
        for (message, expected) in messages.iter().zip(ClientMessage::ACTIONS) {
            let wire = serde_json::to_value(message).unwrap();
            assert_eq!(wire["action"], expected);
            assert_eq!(message.action(), expected);
        }
    }

    #[test]
    fn test_room_joined_wire_format() {
        let peer = PeerId::new();
        let owner = PeerId::new();
        let message = ServerMessage::RoomJoined {
            room_id: RoomId::parse("r1").unwrap(),
            peer_id: peer,
            existing_flows: vec![FlowInfo {
                flow_id: FlowId::from("f-1"),
                owner_peer_id: owner,
                kind: MediaKind::Audio,
            }],
        };
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire["action"], "roomJoined");
        assert_eq!(wire["roomId"], "r1");
        assert_eq!(wire["peerId"], peer.to_string());
        assert_eq!(wire["existingFlows"][0]["flowId"], "f-1");
        assert_eq!(wire["existingFlows"][0]["ownerPeerId"], owner.to_string());
        assert_eq!(wire["existingFlows"][0]["kind"], "audio");
    }

    #[test]
    fn test_transport_reply_wire_format() {
        let message = ServerMessage::CreateRecvTransport {
            params: TransportParams {
                id: TransportId::from("t-7"),
                ice_parameters: json!({ "usernameFragment": "u" }),
                ice_candidates: json!([]),
                dtls_parameters: json!({ "role": "auto" }),
            },
        };
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire["action"], "createRecvTransport");
        assert_eq!(wire["params"]["id"], "t-7");
        assert!(wire["params"]["iceParameters"].is_object());
        assert!(wire["params"]["iceCandidates"].is_array());
        assert!(wire["params"]["dtlsParameters"].is_object());
    }

    #[test]
    fn test_rejection_carries_action_code_and_safe_message() {
        let message = ServerMessage::rejection(Some("produce"), &SfuError::TransportMissing("send"));
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire["action"], "error");
        assert_eq!(wire["request"], "produce");
        assert_eq!(wire["code"], 3);
        assert_eq!(wire["message"], "Create a send transport first");

        let message = ServerMessage::rejection(None, &SfuError::Internal("x".to_string()));
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(wire["action"], "error");
        assert!(wire.get("request").is_none());
        assert_eq!(wire["code"], 6);

        let parsed: ServerMessage = serde_json::from_value(wire).unwrap();
        assert!(matches!(parsed, ServerMessage::Error { request: None, code: 6, .. }));
    }
}
