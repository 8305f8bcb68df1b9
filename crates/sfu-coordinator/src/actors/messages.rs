//! Message types for actor communication.
//!
//! - `RegistryMessage`: messages to `RoomRegistryActor`
//! - `RoomMessage`: messages to `RoomActor`
//! - `PeerCommand`: messages to `PeerSessionActor`
//! - `RoomEvent`: room → peer notifications, including the protocol notices
//!   the peer forwards to its client

use crate::errors::SfuError;
use crate::media::{MediaKind, ProducerHandle, RouterHandle};
use crate::signaling::{ClientMessage, DecodeFailure, FlowInfo, ServerMessage};

use super::room::RoomActorHandle;

use common::types::{FlowId, PeerId, RoomId};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// Registry Messages
// ============================================================================

/// Messages sent to the `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Join a room, creating it (and its routing context) if absent.
    JoinRoom {
        room_id: RoomId,
        member: RoomMember,
        respond_to: oneshot::Sender<Result<JoinOutcome, SfuError>>,
    },

    /// Remove a room if it has no peers left. Responds `true` if removed.
    RemoveRoomIfEmpty {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<bool, SfuError>>,
    },

    /// Force-end a room: every peer is detached and notified.
    EndRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Get information about a room.
    GetRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<RoomInfo, SfuError>>,
    },

    /// Get current registry status.
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting new rooms and close every room.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
}

/// Result of a successful join through the registry.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub room: RoomActorHandle,
    /// Incarnation of the room; events from older incarnations are ignored.
    pub generation: u64,
    pub router: RouterHandle,
    /// Flows published before the join, in publication order.
    pub existing_flows: Vec<FlowInfo>,
    /// Whether this join created the room.
    pub created: bool,
}

/// Registry status snapshot.
#[derive(Debug, Clone)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub connection_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Room information as reported by the registry.
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub generation: u64,
    pub peer_count: usize,
    pub flow_count: usize,
    pub created_at: i64,
}

// ============================================================================
// Room Messages
// ============================================================================

/// Messages sent to a `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// Add a peer. Responds with the flows published before the join.
    Join {
        member: RoomMember,
        respond_to: oneshot::Sender<Result<Vec<FlowInfo>, SfuError>>,
    },

    /// Remove a peer, its flows and its consumption records.
    Leave {
        peer_id: PeerId,
        respond_to: oneshot::Sender<LeaveOutcome>,
    },

    /// Publish a flow and announce it to every other peer.
    AddFlow {
        record: FlowRecord,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Flows the peer may still consume (not its own, not yet consumed).
    ConsumableFlows {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Result<Vec<FlowInfo>, SfuError>>,
    },

    /// Record that `peer_id` now consumes `flow_id`. `Ok(false)` if already recorded.
    RecordConsumer {
        peer_id: PeerId,
        flow_id: FlowId,
        respond_to: oneshot::Sender<Result<bool, SfuError>>,
    },

    /// Close the room if no peer is left. Responds `true` if closed.
    CloseIfEmpty { respond_to: oneshot::Sender<bool> },

    /// Notify every peer and stop. Responds before the routing context is
    /// released.
    End { respond_to: oneshot::Sender<()> },

    /// Get current room state.
    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

/// How the room reaches one member.
///
/// The room never writes to a client directly. Every notice goes through the
/// member's peer actor, which orders it after its own replies.
#[derive(Debug, Clone)]
pub struct RoomMember {
    pub peer_id: PeerId,
    pub events: mpsc::UnboundedSender<RoomEvent>,
}

/// A published flow as held by the room.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub flow_id: FlowId,
    pub owner: PeerId,
    pub kind: MediaKind,
    pub producer: ProducerHandle,
}

impl FlowRecord {
    #[must_use]
    pub fn new(owner: PeerId, producer: ProducerHandle) -> Self {
        Self {
            flow_id: producer.id.clone(),
            owner,
            kind: producer.kind,
            producer,
        }
    }

    #[must_use]
    pub fn info(&self) -> FlowInfo {
        FlowInfo {
            flow_id: self.flow_id.clone(),
            owner_peer_id: self.owner,
            kind: self.kind,
        }
    }
}

/// Result of removing a peer from a room.
#[derive(Debug, Clone, Default)]
pub struct LeaveOutcome {
    /// Whether the peer was still a member.
    pub was_member: bool,
    /// Flows the peer owned, now unpublished.
    pub removed_flows: Vec<FlowId>,
    /// Peers left in the room.
    pub remaining: usize,
}

/// Room state snapshot.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_id: RoomId,
    pub generation: u64,
    pub peers: Vec<PeerId>,
    pub flows: Vec<FlowInfo>,
    pub consumer_count: usize,
    pub created_at: i64,
    pub mailbox_depth: usize,
}

// ============================================================================
// Room Events
// ============================================================================

/// Room → peer notifications.
///
/// Delivered on an unbounded channel so the room never blocks on a peer.
/// Nothing is dropped on the way: a peer that cannot pass a notice on to its
/// client is disconnected instead.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// A protocol notice (`newProducer`, `peerDisconnected`) for the client.
    Notify {
        generation: u64,
        message: ServerMessage,
    },
    /// These flows were unpublished; close any consumer of them.
    FlowsClosed {
        generation: u64,
        flow_ids: Vec<FlowId>,
    },
    /// The room was force-ended; detach, release everything and tell the
    /// client with `roomEnded`.
    RoomEnded { generation: u64 },
}

impl RoomEvent {
    #[must_use]
    pub fn generation(&self) -> u64 {
        match self {
            RoomEvent::Notify { generation, .. }
            | RoomEvent::FlowsClosed { generation, .. }
            | RoomEvent::RoomEnded { generation } => *generation,
        }
    }
}

// ============================================================================
// Peer Commands
// ============================================================================

/// Messages sent to a `PeerSessionActor`.
#[derive(Debug)]
pub enum PeerCommand {
    /// A decoded client request.
    Client(ClientMessage),

    /// A frame that failed to decode. Answered in order with the requests
    /// around it.
    Malformed(DecodeFailure),

    /// Get current session state.
    Snapshot {
        respond_to: oneshot::Sender<PeerSnapshot>,
    },
}

/// Lifecycle of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLifecycle {
    Active,
    /// Connection closed; teardown in progress.
    Closing,
    Closed,
}

/// Peer session snapshot.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub lifecycle: PeerLifecycle,
    pub room_id: Option<RoomId>,
    pub has_send_transport: bool,
    pub has_recv_transport: bool,
    pub producers: Vec<FlowId>,
    /// Source flows of this peer's consumers.
    pub consuming: Vec<FlowId>,
}
