//! In-process media engine.
//!
//! `LoopbackEngine` performs the bookkeeping of a real SFU engine (routing
//! contexts, transports, producers, consumers, cascading closes, codec
//! matching) without moving any media. The coordinator binary runs on it
//! when no external engine is attached, and tests use it to assert that
//! teardown leaves no engine handle behind.

use super::{
    CodecCapability, ConsumerHandle, MediaEngine, MediaError, MediaKind, MediaResource,
    ProducerHandle, RouterHandle, TransportDescriptor, TransportDirection, TransportOptions,
};
use async_trait::async_trait;
use common::types::{ConsumerId, FlowId, RouterId, TransportId};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// First port handed out in ICE candidates.
const PORT_RANGE_START: u16 = 40_000;
/// Number of ports in the candidate range.
const PORT_RANGE_LEN: u16 = 10_000;

/// Open handle counts, for leak assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackCounts {
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

impl LoopbackCounts {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug)]
struct RouterEntry {
    codecs: Vec<CodecCapability>,
}

#[derive(Debug)]
struct TransportEntry {
    router: RouterId,
    direction: TransportDirection,
    connected: bool,
}

#[derive(Debug)]
struct ProducerEntry {
    router: RouterId,
    transport: TransportId,
    kind: MediaKind,
    mime_types: Vec<String>,
}

#[derive(Debug)]
struct ConsumerEntry {
    transport: TransportId,
    flow: FlowId,
}

#[derive(Debug, Default)]
struct LoopbackState {
    routers: HashMap<RouterId, RouterEntry>,
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<FlowId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    next_port: u16,
    next_mid: u32,
}

impl LoopbackState {
    fn allocate_port(&mut self) -> u16 {
        let port = PORT_RANGE_START + self.next_port;
        self.next_port = (self.next_port + 1) % PORT_RANGE_LEN;
        port
    }

    fn remove_consumers_where(&mut self, predicate: impl Fn(&ConsumerEntry) -> bool) {
        self.consumers.retain(|_, entry| !predicate(entry));
    }

    fn close_producer(&mut self, flow: &FlowId) {
        if self.producers.remove(flow).is_some() {
            self.remove_consumers_where(|c| &c.flow == flow);
        }
    }

    fn close_transport(&mut self, transport: &TransportId) {
        if self.transports.remove(transport).is_none() {
            return;
        }
        let owned: Vec<FlowId> = self
            .producers
            .iter()
            .filter(|(_, p)| &p.transport == transport)
            .map(|(id, _)| id.clone())
            .collect();
        for flow in &owned {
            self.close_producer(flow);
        }
        self.remove_consumers_where(|c| &c.transport == transport);
    }

    fn close_router(&mut self, router: &RouterId) {
        if self.routers.remove(router).is_none() {
            return;
        }
        let transports: Vec<TransportId> = self
            .transports
            .iter()
            .filter(|(_, t)| &t.router == router)
            .map(|(id, _)| id.clone())
            .collect();
        for transport in &transports {
            self.close_transport(transport);
        }
        self.producers.retain(|_, p| &p.router != router);
    }
}

/// Bookkeeping-only media engine.
#[derive(Debug)]
pub struct LoopbackEngine {
    announced_ip: String,
    state: Mutex<LoopbackState>,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new(announced_ip: impl Into<String>) -> Self {
        Self {
            announced_ip: announced_ip.into(),
            state: Mutex::new(LoopbackState::default()),
        }
    }

    /// Snapshot of currently open handles.
    pub async fn open_handles(&self) -> LoopbackCounts {
        let state = self.state.lock().await;
        LoopbackCounts {
            routers: state.routers.len(),
            transports: state.transports.len(),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
        }
    }

    fn mint(prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4())
    }

    fn random_token(len: usize) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn random_fingerprint() -> String {
        let mut rng = rand::thread_rng();
        (0..32)
            .map(|_| format!("{:02X}", rng.gen::<u8>()))
            .collect::<Vec<_>>()
            .join(":")
    }

    fn rtp_capabilities(codecs: &[CodecCapability]) -> Value {
        let codecs: Vec<Value> = codecs
            .iter()
            .zip(100u8..)
            .map(|(codec, payload_type)| {
                let mut entry = json!({
                    "kind": codec.kind,
                    "mimeType": codec.mime_type,
                    "clockRate": codec.clock_rate,
                    "preferredPayloadType": payload_type,
                    "rtcpFeedback": [],
                });
                if let (Some(channels), Some(map)) = (codec.channels, entry.as_object_mut()) {
                    map.insert("channels".to_string(), json!(channels));
                }
                entry
            })
            .collect();
        json!({ "codecs": codecs, "headerExtensions": [] })
    }

    /// `mimeType` values listed under `codecs` in RTP parameters or capabilities.
    fn mime_types(parameters: &Value) -> Vec<String> {
        parameters
            .get("codecs")
            .and_then(Value::as_array)
            .map(|codecs| {
                codecs
                    .iter()
                    .filter_map(|c| c.get("mimeType").and_then(Value::as_str))
                    .map(str::to_ascii_lowercase)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Receiver codecs able to decode the producer, by mime type or (when the
    /// producer declared no codecs) by kind.
    fn matching_codecs(producer: &ProducerEntry, rtp_capabilities: &Value) -> Vec<Value> {
        let Some(offered) = rtp_capabilities.get("codecs").and_then(Value::as_array) else {
            return Vec::new();
        };
        offered
            .iter()
            .filter(|codec| {
                let mime = codec
                    .get("mimeType")
                    .and_then(Value::as_str)
                    .map(str::to_ascii_lowercase);
                match mime {
                    Some(mime) if !producer.mime_types.is_empty() => {
                        producer.mime_types.contains(&mime)
                    }
                    Some(mime) => mime.starts_with(&format!("{}/", producer.kind.as_str())),
                    None => false,
                }
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_routing_context(
        &self,
        codecs: &[CodecCapability],
    ) -> Result<RouterHandle, MediaError> {
        if codecs.is_empty() {
            return Err(MediaError::Rejected(
                "routing context needs at least one codec".to_string(),
            ));
        }
        let id = RouterId(Self::mint("router"));
        let mut state = self.state.lock().await;
        state.routers.insert(
            id.clone(),
            RouterEntry {
                codecs: codecs.to_vec(),
            },
        );
        Ok(RouterHandle {
            id,
            rtp_capabilities: Self::rtp_capabilities(codecs),
        })
    }

    async fn close_routing_context(&self, router: &RouterId) -> Result<(), MediaError> {
        self.state.lock().await.close_router(router);
        Ok(())
    }

    async fn create_transport(
        &self,
        router: &RouterId,
        options: &TransportOptions,
    ) -> Result<TransportDescriptor, MediaError> {
        let mut state = self.state.lock().await;
        if !state.routers.contains_key(router) {
            return Err(MediaError::UnknownHandle(router.to_string()));
        }
        if !options.enable_udp && !options.enable_tcp {
            return Err(MediaError::Rejected(
                "transport needs UDP or TCP enabled".to_string(),
            ));
        }

        let id = TransportId(Self::mint("transport"));
        let port = state.allocate_port();
        let ip = if options.announced_ip.is_empty() {
            self.announced_ip.as_str()
        } else {
            options.announced_ip.as_str()
        };

        let mut candidates = Vec::new();
        let (udp_priority, tcp_priority) = if options.prefer_udp {
            (1_076_302_079_u32, 1_076_276_479_u32)
        } else {
            (1_076_276_479_u32, 1_076_302_079_u32)
        };
        if options.enable_udp {
            candidates.push(json!({
                "foundation": "udpcandidate",
                "priority": udp_priority,
                "ip": ip,
                "protocol": "udp",
                "port": port,
                "type": "host",
            }));
        }
        if options.enable_tcp {
            candidates.push(json!({
                "foundation": "tcpcandidate",
                "priority": tcp_priority,
                "ip": ip,
                "protocol": "tcp",
                "port": port,
                "type": "host",
                "tcpType": "passive",
            }));
        }

        state.transports.insert(
            id.clone(),
            TransportEntry {
                router: router.clone(),
                direction: options.direction,
                connected: false,
            },
        );

        Ok(TransportDescriptor {
            id,
            direction: options.direction,
            ice_parameters: json!({
                "usernameFragment": Self::random_token(16),
                "password": Self::random_token(32),
                "iceLite": true,
            }),
            ice_candidates: Value::Array(candidates),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [
                    { "algorithm": "sha-256", "value": Self::random_fingerprint() }
                ],
            }),
        })
    }

    async fn connect_transport(
        &self,
        transport: &TransportId,
        dtls_parameters: &Value,
    ) -> Result<(), MediaError> {
        let has_fingerprints = dtls_parameters
            .get("fingerprints")
            .and_then(Value::as_array)
            .is_some_and(|f| !f.is_empty());
        let mut state = self.state.lock().await;
        let entry = state
            .transports
            .get_mut(transport)
            .ok_or_else(|| MediaError::UnknownHandle(transport.to_string()))?;
        if entry.connected {
            return Err(MediaError::Rejected("transport already connected".to_string()));
        }
        if !has_fingerprints {
            return Err(MediaError::Rejected(
                "dtlsParameters must carry fingerprints".to_string(),
            ));
        }
        entry.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        transport: &TransportId,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerHandle, MediaError> {
        let mime_types = Self::mime_types(rtp_parameters);
        let mut state = self.state.lock().await;
        let entry = state
            .transports
            .get(transport)
            .ok_or_else(|| MediaError::UnknownHandle(transport.to_string()))?;
        if entry.direction != TransportDirection::Send {
            return Err(MediaError::Rejected(
                "cannot produce on a receive transport".to_string(),
            ));
        }
        let router = entry.router.clone();

        if !mime_types.is_empty() {
            let supported = state.routers.get(&router).is_some_and(|r| {
                r.codecs.iter().any(|c| {
                    c.kind == kind && mime_types.contains(&c.mime_type.to_ascii_lowercase())
                })
            });
            if !supported {
                return Err(MediaError::Rejected(format!(
                    "no supported {kind} codec in rtpParameters"
                )));
            }
        }

        let id = FlowId(Self::mint("producer"));
        state.producers.insert(
            id.clone(),
            ProducerEntry {
                router,
                transport: transport.clone(),
                kind,
                mime_types,
            },
        );
        Ok(ProducerHandle {
            id,
            kind,
            rtp_parameters: rtp_parameters.clone(),
        })
    }

    async fn can_consume(
        &self,
        router: &RouterId,
        flow: &FlowId,
        rtp_capabilities: &Value,
    ) -> Result<bool, MediaError> {
        let state = self.state.lock().await;
        // Unknown producers are not consumable rather than an error.
        Ok(state
            .producers
            .get(flow)
            .filter(|p| &p.router == router)
            .is_some_and(|p| !Self::matching_codecs(p, rtp_capabilities).is_empty()))
    }

    async fn consume(
        &self,
        transport: &TransportId,
        flow: &FlowId,
        rtp_capabilities: &Value,
    ) -> Result<ConsumerHandle, MediaError> {
        let mut state = self.state.lock().await;
        let entry = state
            .transports
            .get(transport)
            .ok_or_else(|| MediaError::UnknownHandle(transport.to_string()))?;
        if entry.direction != TransportDirection::Recv {
            return Err(MediaError::Rejected(
                "cannot consume on a send transport".to_string(),
            ));
        }
        let producer = state
            .producers
            .get(flow)
            .ok_or_else(|| MediaError::UnknownHandle(flow.to_string()))?;
        if producer.router != entry.router {
            return Err(MediaError::Rejected(
                "producer belongs to another routing context".to_string(),
            ));
        }
        let codecs = Self::matching_codecs(producer, rtp_capabilities);
        if codecs.is_empty() {
            return Err(MediaError::Rejected(
                "receiver cannot decode this flow".to_string(),
            ));
        }
        let kind = producer.kind;

        let mid = state.next_mid;
        state.next_mid = state.next_mid.wrapping_add(1);
        let id = ConsumerId(Self::mint("consumer"));
        state.consumers.insert(
            id.clone(),
            ConsumerEntry {
                transport: transport.clone(),
                flow: flow.clone(),
            },
        );

        Ok(ConsumerHandle {
            id,
            flow_id: flow.clone(),
            kind,
            rtp_parameters: json!({
                "mid": mid.to_string(),
                "codecs": codecs,
                "encodings": [{ "ssrc": rand::thread_rng().gen::<u32>() }],
                "headerExtensions": [],
            }),
        })
    }

    async fn close(&self, resource: &MediaResource) -> Result<(), MediaError> {
        let mut state = self.state.lock().await;
        match resource {
            MediaResource::Router(id) => state.close_router(id),
            MediaResource::Transport(id) => state.close_transport(id),
            MediaResource::Producer(id) => state.close_producer(id),
            MediaResource::Consumer(id) => {
                state.consumers.remove(id);
            }
        }
        Ok(())
    }
}
