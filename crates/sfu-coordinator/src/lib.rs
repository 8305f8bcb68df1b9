//! SFU Coordinator Library
//!
//! Signaling coordinator for a selective-forwarding media server:
//!
//! - Room registry: rooms are created on first join and removed when the last
//!   peer leaves
//! - Per-peer sessions over WebSocket: transports, published flows, consumers
//! - Fan-out of room events (`newProducer`, `peerDisconnected`, `roomEnded`)
//! - Media work is delegated to a pluggable [`media::MediaEngine`]
//!
//! # Architecture
//!
//! ```text
//! RoomRegistryActor (singleton)
//! └── RoomActor (one per active room)
//!
//! PeerSessionActor (one per WebSocket connection)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Actor model implementation
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client error codes
//! - [`media`] - Media-engine capability, call policy and loopback engine
//! - [`observability`] - Metrics and health endpoints
//! - [`signaling`] - Wire messages and frame codec
//! - [`transport`] - WebSocket endpoint

pub mod actors;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod signaling;
pub mod transport;
