//! `RoomActor` - per-room actor that owns membership and the flow list.
//!
//! Each `RoomActor`:
//! - Owns the members, the ordered flow list and the consumption records
//! - Holds the room's routing context and releases it when the room closes
//! - Serializes every mutation, so a peer's removal, its flows' removal and
//!   the `peerDisconnected` broadcast are observed as one step
//!
//! The room never waits on a member. Notices go to each member's peer actor
//! as [`RoomEvent`]s; the peer actor forwards them to its client.
//!
//! Requests that end the room are answered before the routing context is
//! released, so callers never wait on the media engine.

use crate::errors::SfuError;
use crate::media::{MediaGateway, RouterHandle};
use crate::signaling::{FlowInfo, ServerMessage};

use super::flows::FlowRegistry;
use super::messages::{FlowRecord, LeaveOutcome, RoomEvent, RoomMember, RoomMessage, RoomState};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::{FlowId, PeerId, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Handle to a `RoomActor`.
#[derive(Debug, Clone)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: RoomId,
    generation: u64,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Send a request and wait for the reply. A stopped room yields `RoomClosed`.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if self.sender.send(build(tx)).await.is_err() {
            self.mailbox.cancel_enqueue();
            return Err(SfuError::RoomClosed(self.room_id.to_string()));
        }
        rx.await
            .map_err(|_| SfuError::RoomClosed(self.room_id.to_string()))
    }

    /// Add a member. Returns the flows published before the join.
    pub async fn join(&self, member: RoomMember) -> Result<Vec<FlowInfo>, SfuError> {
        self.request(|respond_to| RoomMessage::Join { member, respond_to })
            .await?
    }

    /// Remove a member with its flows and consumption records.
    pub async fn leave(&self, peer_id: PeerId) -> Result<LeaveOutcome, SfuError> {
        self.request(|respond_to| RoomMessage::Leave {
            peer_id,
            respond_to,
        })
        .await
    }

    /// Publish a flow and announce it to the other members.
    pub async fn add_flow(&self, record: FlowRecord) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::AddFlow { record, respond_to })
            .await?
    }

    pub async fn consumable_flows(&self, peer_id: PeerId) -> Result<Vec<FlowInfo>, SfuError> {
        self.request(|respond_to| RoomMessage::ConsumableFlows {
            peer_id,
            respond_to,
        })
        .await?
    }

    /// Record a consumption. `Ok(false)` if the pair was already recorded.
    pub async fn record_consumer(&self, peer_id: PeerId, flow_id: FlowId) -> Result<bool, SfuError> {
        self.request(|respond_to| RoomMessage::RecordConsumer {
            peer_id,
            flow_id,
            respond_to,
        })
        .await?
    }

    /// Close the room if nobody is in it. `Ok(true)` if it closed; the routing
    /// context is released after the reply.
    pub async fn close_if_empty(&self) -> Result<bool, SfuError> {
        self.request(|respond_to| RoomMessage::CloseIfEmpty { respond_to })
            .await
    }

    /// Force-end the room.
    pub async fn end(&self) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::End { respond_to })
            .await
    }

    pub async fn get_state(&self) -> Result<RoomState, SfuError> {
        self.request(|respond_to| RoomMessage::GetState { respond_to })
            .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Whether the actor has stopped taking messages.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: RoomId,
    /// Incarnation number assigned by the registry.
    generation: u64,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    router: RouterHandle,
    media: MediaGateway,
    members: HashMap<PeerId, RoomMember>,
    flows: FlowRegistry,
    max_peers: usize,
    created_at: i64,
    /// Routing context released; no further messages are handled.
    closed: bool,
    metrics: Arc<ActorMetrics>,
    /// Shared with every handle, which counts messages as they are sent.
    mailbox: Arc<MailboxMonitor>,
}

impl RoomActor {
    /// Spawn a room actor around an already created routing context.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        room_id: RoomId,
        generation: u64,
        router: RouterHandle,
        media: MediaGateway,
        max_peers: usize,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Room, room_id.as_str()));

        let actor = Self {
            room_id: room_id.clone(),
            generation,
            receiver,
            cancel_token: cancel_token.clone(),
            router,
            media,
            members: HashMap::new(),
            flows: FlowRegistry::new(),
            max_peers,
            created_at: chrono::Utc::now().timestamp(),
            closed: false,
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
            generation,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sfu.actor.room", fields(room_id = %self.room_id, generation = self.generation))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            generation = self.generation,
            router_id = %self.router.id,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                            if self.closed {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "sfu.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            self.release().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            generation = self.generation,
            messages_processed = self.mailbox.messages_processed(),
            peak_mailbox_depth = self.mailbox.peak_depth(),
            "RoomActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join { member, respond_to } => {
                let _ = respond_to.send(self.handle_join(member));
            }
            RoomMessage::Leave {
                peer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_leave(peer_id));
            }
            RoomMessage::AddFlow { record, respond_to } => {
                let _ = respond_to.send(self.handle_add_flow(record));
            }
            RoomMessage::ConsumableFlows {
                peer_id,
                respond_to,
            } => {
                let result = self
                    .require_member(peer_id)
                    .map(|()| self.flows.consumable_by(peer_id));
                let _ = respond_to.send(result);
            }
            RoomMessage::RecordConsumer {
                peer_id,
                flow_id,
                respond_to,
            } => {
                let result = self
                    .require_member(peer_id)
                    .and_then(|()| self.flows.record_consumer(peer_id, &flow_id));
                let _ = respond_to.send(result);
            }
            RoomMessage::CloseIfEmpty { respond_to } => {
                let closed = self.members.is_empty();
                let _ = respond_to.send(closed);
                if closed {
                    debug!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        "Last peer left, closing room"
                    );
                    self.release().await;
                }
            }
            RoomMessage::End { respond_to } => {
                self.handle_end();
                let _ = respond_to.send(());
                self.release().await;
            }
            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }
        }
    }

    fn require_member(&self, peer_id: PeerId) -> Result<(), SfuError> {
        if self.members.contains_key(&peer_id) {
            Ok(())
        } else {
            Err(SfuError::NotJoined)
        }
    }

    fn handle_join(&mut self, member: RoomMember) -> Result<Vec<FlowInfo>, SfuError> {
        if self.members.contains_key(&member.peer_id) {
            return Err(SfuError::Conflict("Peer already in room".to_string()));
        }
        if self.members.len() >= self.max_peers {
            warn!(
                target: "sfu.actor.room",
                room_id = %self.room_id,
                max_peers = self.max_peers,
                "Room at capacity, rejecting join"
            );
            return Err(SfuError::RoomCapacityExceeded(self.room_id.to_string()));
        }

        let existing_flows = self.flows.snapshot();
        let peer_id = member.peer_id;
        self.members.insert(peer_id, member);

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            peers = self.members.len(),
            existing_flows = existing_flows.len(),
            "Peer joined room"
        );

        Ok(existing_flows)
    }

    fn handle_leave(&mut self, peer_id: PeerId) -> LeaveOutcome {
        if self.members.remove(&peer_id).is_none() {
            return LeaveOutcome {
                was_member: false,
                removed_flows: Vec::new(),
                remaining: self.members.len(),
            };
        }

        let removed_flows: Vec<FlowId> = self
            .flows
            .remove_owned_by(peer_id)
            .into_iter()
            .map(|record| record.flow_id)
            .collect();
        self.flows.forget_consumer(peer_id);

        // Consumers of the departed flows are closed before anyone hears of
        // the departure.
        if !removed_flows.is_empty() {
            self.send_event(
                None,
                &RoomEvent::FlowsClosed {
                    generation: self.generation,
                    flow_ids: removed_flows.clone(),
                },
            );
        }
        self.broadcast(None, ServerMessage::PeerDisconnected { peer_id });

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            flows_removed = removed_flows.len(),
            remaining = self.members.len(),
            "Peer left room"
        );

        LeaveOutcome {
            was_member: true,
            removed_flows,
            remaining: self.members.len(),
        }
    }

    fn handle_add_flow(&mut self, record: FlowRecord) -> Result<(), SfuError> {
        self.require_member(record.owner)?;

        let announcement = ServerMessage::NewProducer {
            owner_peer_id: record.owner,
            flow_id: record.flow_id.clone(),
            kind: record.kind,
        };
        let owner = record.owner;
        let flow_id = record.flow_id.clone();
        self.flows.insert(record)?;

        let notified = self.broadcast(Some(owner), announcement);

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %owner,
            flow_id = %flow_id,
            notified = notified,
            "Flow published"
        );
        Ok(())
    }

    fn handle_end(&mut self) {
        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peers = self.members.len(),
            flows = self.flows.len(),
            "Ending room"
        );
        self.detach_all();
    }

    /// Tell every member the room is over and forget them.
    fn detach_all(&mut self) {
        self.send_event(
            None,
            &RoomEvent::RoomEnded {
                generation: self.generation,
            },
        );
        self.members.clear();
    }

    /// Send `message` to every member except `exclude`. Returns how many
    /// members were reached.
    fn broadcast(&self, exclude: Option<PeerId>, message: ServerMessage) -> usize {
        self.send_event(
            exclude,
            &RoomEvent::Notify {
                generation: self.generation,
                message,
            },
        )
    }

    fn send_event(&self, exclude: Option<PeerId>, event: &RoomEvent) -> usize {
        self.members
            .values()
            .filter(|member| Some(member.peer_id) != exclude)
            .filter(|member| member.events.send(event.clone()).is_ok())
            .count()
    }

    /// Release the routing context. Runs once.
    async fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.flows.drain();
        if let Err(e) = self.media.close_routing_context(&self.router.id).await {
            warn!(
                target: "sfu.actor.room",
                room_id = %self.room_id,
                router_id = %self.router.id,
                error = %e,
                "Failed to close routing context"
            );
        }
    }

    fn get_state(&self) -> RoomState {
        RoomState {
            room_id: self.room_id.clone(),
            generation: self.generation,
            peers: self.members.keys().copied().collect(),
            flows: self.flows.snapshot(),
            consumer_count: self.flows.consumer_count(),
            created_at: self.created_at,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peers = self.members.len(),
            "Performing graceful shutdown"
        );
        self.detach_all();
        self.release().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::media::{default_codecs, LoopbackEngine, MediaKind, ProducerHandle};
    use serde_json::Value;
    use std::time::Duration;

    struct Member {
        member: RoomMember,
        events: mpsc::UnboundedReceiver<RoomEvent>,
    }

    impl Member {
        fn peer_id(&self) -> PeerId {
            self.member.peer_id
        }

        /// Every event queued so far.
        fn drain(&mut self) -> Vec<RoomEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn member() -> Member {
        let (events_tx, events) = mpsc::unbounded_channel();
        Member {
            member: RoomMember {
                peer_id: PeerId::new(),
                events: events_tx,
            },
            events,
        }
    }

    fn notice(message: ServerMessage) -> RoomEvent {
        RoomEvent::Notify {
            generation: 1,
            message,
        }
    }

    fn flow(owner: PeerId, id: &str) -> FlowRecord {
        FlowRecord::new(
            owner,
            ProducerHandle {
                id: FlowId::from(id),
                kind: MediaKind::Audio,
                rtp_parameters: Value::Null,
            },
        )
    }

    async fn spawn_room(max_peers: usize) -> (RoomActorHandle, JoinHandle<()>, Arc<LoopbackEngine>) {
        let engine = Arc::new(LoopbackEngine::new("127.0.0.1"));
        let media = MediaGateway::new(engine.clone(), Duration::from_secs(5));
        let router = media.create_routing_context(&default_codecs()).await.unwrap();
        let (handle, task) = RoomActor::spawn(
            RoomId::parse("r1").unwrap(),
            1,
            router,
            media,
            max_peers,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        (handle, task, engine)
    }

    #[tokio::test]
    async fn test_join_returns_existing_flows_in_order() {
        let (room, _task, _engine) = spawn_room(10).await;
        let a = member();
        let mut b = member();

        assert!(room.join(a.member.clone()).await.unwrap().is_empty());
        room.add_flow(flow(a.peer_id(), "fa")).await.unwrap();
        room.add_flow(flow(a.peer_id(), "fb")).await.unwrap();

        let existing = room.join(b.member.clone()).await.unwrap();
        let ids: Vec<_> = existing.iter().map(|f| f.flow_id.clone()).collect();
        assert_eq!(ids, vec![FlowId::from("fa"), FlowId::from("fb")]);
        assert!(existing.iter().all(|f| f.owner_peer_id == a.peer_id()));
        assert!(b.drain().is_empty(), "flows published before the join are not announced");
    }

    #[tokio::test]
    async fn test_duplicate_join_and_capacity() {
        let (room, _task, _engine) = spawn_room(1).await;
        let a = member();
        room.join(a.member.clone()).await.unwrap();

        assert!(matches!(
            room.join(a.member.clone()).await,
            Err(SfuError::Conflict(_))
        ));
        assert!(matches!(
            room.join(member().member).await,
            Err(SfuError::RoomCapacityExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_add_flow_announces_to_others_only() {
        let (room, _task, _engine) = spawn_room(10).await;
        let mut a = member();
        let mut b = member();
        room.join(a.member.clone()).await.unwrap();
        room.join(b.member.clone()).await.unwrap();

        room.add_flow(flow(a.peer_id(), "fa")).await.unwrap();

        assert_eq!(
            b.drain(),
            vec![notice(ServerMessage::NewProducer {
                owner_peer_id: a.peer_id(),
                flow_id: FlowId::from("fa"),
                kind: MediaKind::Audio,
            })]
        );
        assert!(a.drain().is_empty(), "owner is not notified");
    }

    #[tokio::test]
    async fn test_add_flow_requires_membership() {
        let (room, _task, _engine) = spawn_room(10).await;
        assert!(matches!(
            room.add_flow(flow(PeerId::new(), "f")).await,
            Err(SfuError::NotJoined)
        ));
    }

    #[tokio::test]
    async fn test_leave_closes_flows_before_announcing_departure() {
        let (room, _task, _engine) = spawn_room(10).await;
        let a = member();
        let mut b = member();
        let a_id = a.peer_id();
        room.join(a.member.clone()).await.unwrap();
        room.join(b.member.clone()).await.unwrap();
        room.add_flow(flow(a_id, "fa")).await.unwrap();
        room.record_consumer(b.peer_id(), FlowId::from("fa"))
            .await
            .unwrap();
        b.drain();

        let outcome = room.leave(a_id).await.unwrap();
        assert!(outcome.was_member);
        assert_eq!(outcome.removed_flows, vec![FlowId::from("fa")]);
        assert_eq!(outcome.remaining, 1);

        assert_eq!(
            b.drain(),
            vec![
                RoomEvent::FlowsClosed {
                    generation: 1,
                    flow_ids: vec![FlowId::from("fa")]
                },
                notice(ServerMessage::PeerDisconnected { peer_id: a_id }),
            ]
        );

        let state = room.get_state().await.unwrap();
        assert!(state.flows.is_empty());
        assert_eq!(state.consumer_count, 0);

        // Idempotent
        let again = room.leave(a_id).await.unwrap();
        assert!(!again.was_member);
        assert_eq!(again.remaining, 1);
        assert!(b.drain().is_empty());
    }

    #[tokio::test]
    async fn test_close_if_empty_releases_router() {
        let (room, task, engine) = spawn_room(10).await;
        let a = member();
        room.join(a.member.clone()).await.unwrap();

        assert!(!room.close_if_empty().await.unwrap());

        room.leave(a.peer_id()).await.unwrap();
        assert!(room.close_if_empty().await.unwrap());

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(engine.open_handles().await.routers, 0);
        assert!(matches!(
            room.get_state().await,
            Err(SfuError::RoomClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_end_notifies_every_member() {
        let (room, task, engine) = spawn_room(10).await;
        let mut a = member();
        let mut b = member();
        room.join(a.member.clone()).await.unwrap();
        room.join(b.member.clone()).await.unwrap();

        room.end().await.unwrap();

        for m in [&mut a, &mut b] {
            assert_eq!(m.drain(), vec![RoomEvent::RoomEnded { generation: 1 }]);
        }

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(engine.open_handles().await.routers, 0);
    }

    #[tokio::test]
    async fn test_cancellation_releases_router() {
        let (room, task, engine) = spawn_room(10).await;
        let mut a = member();
        room.join(a.member.clone()).await.unwrap();

        room.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(room.is_cancelled());
        assert_eq!(a.drain(), vec![RoomEvent::RoomEnded { generation: 1 }]);
        assert!(engine.open_handles().await.is_empty());
    }

    #[tokio::test]
    async fn test_mailbox_depth_counts_queued_requests() {
        let (room, _task, _engine) = spawn_room(10).await;

        // All three are queued before the actor runs.
        let (first, second, third) =
            tokio::join!(room.get_state(), room.get_state(), room.get_state());
        let depths = [first, second, third].map(|state| state.unwrap().mailbox_depth);
        assert_eq!(depths.iter().max(), Some(&3));

        assert_eq!(room.get_state().await.unwrap().mailbox_depth, 1);
    }
}
