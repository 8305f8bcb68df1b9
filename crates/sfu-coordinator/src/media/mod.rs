//! Media-engine capability consumed by the coordinator.
//!
//! The coordinator never touches media. Everything that negotiates codecs,
//! transports or forwards RTP lives behind [`MediaEngine`]; the coordinator
//! only holds the opaque handles the engine returns and releases them again.
//!
//! # Modules
//!
//! - [`gateway`] - [`MediaGateway`], the single call path into the engine
//!   (timeouts, cancellation, latency metrics)
//! - [`loopback`] - [`LoopbackEngine`], an in-process bookkeeping engine

pub mod gateway;
pub mod loopback;

pub use gateway::MediaGateway;
pub use loopback::{LoopbackCounts, LoopbackEngine};

use async_trait::async_trait;
use common::types::{ConsumerId, FlowId, RouterId, TransportId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Media-engine failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// Engine refused the request (bad parameters, wrong state).
    #[error("Media engine rejected the request: {0}")]
    Rejected(String),

    /// Handle does not exist (never created or already closed).
    #[error("Unknown media handle: {0}")]
    UnknownHandle(String),

    /// Engine ran out of workers, ports or memory.
    #[error("Media engine resources exhausted: {0}")]
    Exhausted(String),

    /// Call did not complete within the configured timeout.
    #[error("Media engine call timed out: {operation}")]
    Timeout { operation: &'static str },

    /// Caller's connection closed while the call was in flight.
    #[error("Media engine call cancelled")]
    Cancelled,
}

impl MediaError {
    /// Resource exhaustion is the one engine failure escalated beyond a
    /// per-request rejection.
    #[must_use]
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, MediaError::Exhausted(_))
    }
}

/// Kind of a media flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Returns the kind as used in mime types and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One codec a routing context is willing to forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
}

/// Codec set every routing context is created with: Opus audio and VP8 video.
#[must_use]
pub fn default_codecs() -> Vec<CodecCapability> {
    vec![
        CodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
        },
        CodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
        },
    ]
}

/// Per-room routing context.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterHandle {
    pub id: RouterId,
    /// Capabilities clients load into their device before creating transports.
    pub rtp_capabilities: Value,
}

/// Direction of a peer transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportDirection {
    /// Peer publishes media (producers live here).
    Send,
    /// Peer receives media (consumers live here).
    Recv,
}

impl TransportDirection {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

/// Options for transport creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub direction: TransportDirection,
    /// Address advertised in ICE candidates.
    pub announced_ip: String,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl TransportOptions {
    /// UDP and TCP enabled, UDP preferred.
    #[must_use]
    pub fn new(direction: TransportDirection, announced_ip: impl Into<String>) -> Self {
        Self {
            direction,
            announced_ip: announced_ip.into(),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

/// Transport as created by the engine, with the parameters the client needs.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportDescriptor {
    pub id: TransportId,
    pub direction: TransportDirection,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// A published flow as held by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerHandle {
    pub id: FlowId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// One subscription to a flow as held by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerHandle {
    pub id: ConsumerId,
    pub flow_id: FlowId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// Any engine resource that can be closed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaResource {
    Router(RouterId),
    Transport(TransportId),
    Producer(FlowId),
    Consumer(ConsumerId),
}

impl MediaResource {
    /// Resource kind for logs and metric labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            MediaResource::Router(_) => "router",
            MediaResource::Transport(_) => "transport",
            MediaResource::Producer(_) => "producer",
            MediaResource::Consumer(_) => "consumer",
        }
    }
}

/// External media-engine capability.
///
/// All calls may fail asynchronously. `close` of a handle that is unknown or
/// already closed succeeds, so releases can be repeated safely. Closing a
/// router closes everything created on it; closing a transport closes its
/// producers and consumers; closing a producer closes its consumers.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create the per-room routing context.
    async fn create_routing_context(
        &self,
        codecs: &[CodecCapability],
    ) -> Result<RouterHandle, MediaError>;

    /// Release a routing context and everything created on it.
    async fn close_routing_context(&self, router: &RouterId) -> Result<(), MediaError>;

    /// Create a send or receive transport on a routing context.
    async fn create_transport(
        &self,
        router: &RouterId,
        options: &TransportOptions,
    ) -> Result<TransportDescriptor, MediaError>;

    /// Complete the DTLS handshake parameters for a transport.
    async fn connect_transport(
        &self,
        transport: &TransportId,
        dtls_parameters: &Value,
    ) -> Result<(), MediaError>;

    /// Start receiving a flow from the client on a send transport.
    async fn produce(
        &self,
        transport: &TransportId,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerHandle, MediaError>;

    /// Whether a receiver with `rtp_capabilities` can decode `flow`.
    async fn can_consume(
        &self,
        router: &RouterId,
        flow: &FlowId,
        rtp_capabilities: &Value,
    ) -> Result<bool, MediaError>;

    /// Forward `flow` to the client on a receive transport.
    async fn consume(
        &self,
        transport: &TransportId,
        flow: &FlowId,
        rtp_capabilities: &Value,
    ) -> Result<ConsumerHandle, MediaError>;

    /// Release any handle.
    async fn close(&self, resource: &MediaResource) -> Result<(), MediaError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_wire_format() {
        assert_eq!(serde_json::to_string(&MediaKind::Video).unwrap(), "\"video\"");
        let kind: MediaKind = serde_json::from_str("\"audio\"").unwrap();
        assert_eq!(kind, MediaKind::Audio);
        assert!(serde_json::from_str::<MediaKind>("\"screen\"").is_err());
    }

    #[test]
    fn test_default_codecs() {
        let codecs = default_codecs();
        assert_eq!(codecs.len(), 2);
        assert!(codecs
            .iter()
            .any(|c| c.mime_type == "audio/opus" && c.clock_rate == 48_000 && c.channels == Some(2)));
        assert!(codecs
            .iter()
            .any(|c| c.mime_type == "video/VP8" && c.kind == MediaKind::Video));

        let json = serde_json::to_value(&codecs[1]).unwrap();
        assert!(json.get("channels").is_none());
        assert_eq!(json["mimeType"], "video/VP8");
    }

    #[test]
    fn test_exhaustion_classification() {
        assert!(MediaError::Exhausted("ports".to_string()).is_exhaustion());
        assert!(!MediaError::Rejected("bad".to_string()).is_exhaustion());
        assert!(!MediaError::Timeout { operation: "produce" }.is_exhaustion());
    }
}
