//! `PeerSessionActor` - per-connection actor.
//!
//! Each `PeerSessionActor`:
//! - Handles exactly one signaling connection and at most one room
//! - Processes the peer's requests strictly in arrival order
//! - Owns the peer's engine handles (transports, producers, consumers)
//! - Releases every handle and leaves its room when the connection closes
//!
//! # Lifecycle
//!
//! 1. Spawned by the transport when a connection is accepted
//! 2. Runs until the connection closes or the registry shuts down
//! 3. Teardown: release engine handles, leave the room, remove the room if
//!    this was the last peer
//!
//! Request handlers live in [`super::dispatch`].

use crate::errors::SfuError;
use crate::media::{
    ConsumerHandle, MediaGateway, MediaResource, ProducerHandle, RouterHandle, TransportDescriptor,
};
use crate::signaling::{ClientMessage, DecodeFailure, ServerMessage};

use super::messages::{PeerCommand, PeerLifecycle, PeerSnapshot, RoomEvent};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::outbound::{OutboundChannel, SendFailure};
use super::registry::RoomRegistryHandle;
use super::room::RoomActorHandle;

use common::types::{FlowId, PeerId, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the peer mailbox.
const PEER_CHANNEL_BUFFER: usize = 200;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    /// Address advertised in ICE candidates.
    pub announced_ip: String,
    /// Slots in the outbound queue.
    pub outbound_buffer: usize,
    /// How long a room notice may wait for queue space before the client is
    /// treated as gone.
    pub outbound_stall_timeout: Duration,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            announced_ip: "127.0.0.1".to_string(),
            outbound_buffer: 256,
            outbound_stall_timeout: Duration::from_secs(5),
        }
    }
}

/// Everything a peer session needs from the rest of the process.
#[derive(Clone)]
pub struct PeerContext {
    pub registry: RoomRegistryHandle,
    pub media: MediaGateway,
    pub settings: PeerSettings,
    pub metrics: Arc<ActorMetrics>,
}

/// Handle to a `PeerSessionActor`.
#[derive(Clone, Debug)]
pub struct PeerSessionHandle {
    sender: mpsc::Sender<PeerCommand>,
    cancel_token: CancellationToken,
    peer_id: PeerId,
    mailbox: Arc<MailboxMonitor>,
}

impl PeerSessionHandle {
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn send(&self, command: PeerCommand) -> Result<(), SfuError> {
        self.mailbox.record_enqueue();
        self.sender.send(command).await.map_err(|e| {
            self.mailbox.cancel_enqueue();
            SfuError::Internal(format!("channel send failed: {e}"))
        })
    }

    /// Queue a decoded request.
    pub async fn client_message(&self, message: ClientMessage) -> Result<(), SfuError> {
        self.send(PeerCommand::Client(message)).await
    }

    /// Queue the rejection of an undecodable frame.
    pub async fn malformed(&self, failure: DecodeFailure) -> Result<(), SfuError> {
        self.send(PeerCommand::Malformed(failure)).await
    }

    /// Get the session state.
    pub async fn snapshot(&self) -> Result<PeerSnapshot, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.send(PeerCommand::Snapshot { respond_to: tx }).await?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }


    /// The connection is gone; tear the session down.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the session is cancelled, by `close` or by shutdown.
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await;
    }
}

/// A spawned session: handle, task, and the outbound queue for the writer.
pub struct SpawnedPeer {
    pub handle: PeerSessionHandle,
    pub task: JoinHandle<()>,
    pub outbound: mpsc::Receiver<ServerMessage>,
}

/// The room this peer is in.
#[derive(Debug, Clone)]
pub(super) struct JoinedRoom {
    pub(super) room_id: RoomId,
    pub(super) generation: u64,
    pub(super) handle: RoomActorHandle,
    pub(super) router: RouterHandle,
}

/// The `PeerSessionActor` implementation.
pub struct PeerSessionActor {
    pub(super) peer_id: PeerId,
    receiver: mpsc::Receiver<PeerCommand>,
    /// Room events. The sender is handed to the room on join.
    events: mpsc::UnboundedReceiver<RoomEvent>,
    pub(super) events_tx: mpsc::UnboundedSender<RoomEvent>,
    pub(super) outbound: OutboundChannel,
    pub(super) context: PeerContext,
    /// Child of the registry token; cancelled when the connection closes.
    pub(super) cancel_token: CancellationToken,
    lifecycle: PeerLifecycle,
    pub(super) room: Option<JoinedRoom>,
    pub(super) send_transport: Option<TransportDescriptor>,
    pub(super) recv_transport: Option<TransportDescriptor>,
    pub(super) producers: HashMap<FlowId, ProducerHandle>,
    /// Keyed by source flow: at most one consumer per flow.
    pub(super) consumers: HashMap<FlowId, ConsumerHandle>,
    mailbox: Arc<MailboxMonitor>,
}

impl PeerSessionActor {
    /// Spawn a session for a new connection.
    pub fn spawn(peer_id: PeerId, context: PeerContext) -> SpawnedPeer {
        let (sender, receiver) = mpsc::channel(PEER_CHANNEL_BUFFER);
        let (events_tx, events) = mpsc::unbounded_channel();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Peer, peer_id.to_string()));
        let (outbound, outbound_rx) =
            OutboundChannel::channel(peer_id, context.settings.outbound_buffer);
        let cancel_token = context.registry.child_token();

        context.metrics.connection_created();

        let actor = Self {
            peer_id,
            receiver,
            events,
            events_tx,
            outbound,
            context,
            cancel_token: cancel_token.clone(),
            lifecycle: PeerLifecycle::Active,
            room: None,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            mailbox: Arc::clone(&mailbox),
        };

        let task = tokio::spawn(actor.run());

        SpawnedPeer {
            handle: PeerSessionHandle {
                sender,
                cancel_token,
                peer_id,
                mailbox,
            },
            task,
            outbound: outbound_rx,
        }
    }

    #[instrument(skip_all, name = "sfu.actor.peer", fields(peer_id = %self.peer_id))]
    async fn run(mut self) {
        debug!(
            target: "sfu.actor.peer",
            peer_id = %self.peer_id,
            "PeerSessionActor started"
        );

        loop {
            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.actor.peer",
                        peer_id = %self.peer_id,
                        "PeerSessionActor received cancellation signal"
                    );
                    break;
                }

                Some(event) = self.events.recv() => {
                    self.handle_room_event(event).await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(command) => {
                            self.handle_command(command).await;
                            self.mailbox.record_dequeue();
                            self.context.metrics.record_message_processed();
                        }
                        None => {
                            debug!(
                                target: "sfu.actor.peer",
                                peer_id = %self.peer_id,
                                "PeerSessionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.teardown().await;

        info!(
            target: "sfu.actor.peer",
            peer_id = %self.peer_id,
            messages_processed = self.mailbox.messages_processed(),
            peak_mailbox_depth = self.mailbox.peak_depth(),
            messages_dropped = self.mailbox.messages_dropped(),
            "PeerSessionActor stopped"
        );
    }

    async fn handle_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::Client(message) => self.dispatch(message).await,
            PeerCommand::Malformed(failure) => {
                debug!(
                    target: "sfu.actor.peer",
                    peer_id = %self.peer_id,
                    error = %failure.error,
                    "Rejecting malformed frame"
                );
                self.reject(failure.request.as_deref(), &failure.error).await;
            }
            PeerCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: self.peer_id,
            lifecycle: self.lifecycle,
            room_id: self.room.as_ref().map(|room| room.room_id.clone()),
            has_send_transport: self.send_transport.is_some(),
            has_recv_transport: self.recv_transport.is_some(),
            producers: self.producers.keys().cloned().collect(),
            consuming: self.consumers.keys().cloned().collect(),
        }
    }

    /// Queue a message for the client. Gives up if the session is cancelled
    /// while the queue is full.
    pub(super) async fn reply(&self, message: ServerMessage) -> bool {
        tokio::select! {
            biased;
            () = self.cancel_token.cancelled() => false,
            sent = self.outbound.send(message) => sent,
        }
    }

    async fn handle_room_event(&mut self, event: RoomEvent) {
        let Some(joined) = &self.room else {
            return;
        };
        if event.generation() != joined.generation {
            debug!(
                target: "sfu.actor.peer",
                peer_id = %self.peer_id,
                event_generation = event.generation(),
                current_generation = joined.generation,
                "Ignoring event from a previous room incarnation"
            );
            return;
        }

        match event {
            RoomEvent::Notify { message, .. } => self.forward_notice(message).await,
            RoomEvent::FlowsClosed { flow_ids, .. } => {
                for flow_id in flow_ids {
                    if let Some(consumer) = self.consumers.remove(&flow_id) {
                        debug!(
                            target: "sfu.actor.peer",
                            peer_id = %self.peer_id,
                            flow_id = %flow_id,
                            consumer_id = %consumer.id,
                            "Source flow closed, releasing consumer"
                        );
                        self.release(MediaResource::Consumer(consumer.id)).await;
                    }
                }
            }
            RoomEvent::RoomEnded { .. } => {
                let room_id = joined.room_id.clone();
                info!(
                    target: "sfu.actor.peer",
                    peer_id = %self.peer_id,
                    room_id = %room_id,
                    "Room ended, detaching"
                );
                self.room = None;
                self.release_media().await;
                let notice = ServerMessage::RoomEnded { room_id };
                if !self.reply(notice.clone()).await {
                    // Shutdown cancelled the session during the release.
                    let _ = self.outbound.try_send(notice);
                }
            }
        }
    }

    /// Pass a room notice to the client. A client that leaves its queue full
    /// for longer than the stall timeout is disconnected, so it never misses
    /// a notice while staying in the room.
    async fn forward_notice(&self, message: ServerMessage) {
        let allowance = self.context.settings.outbound_stall_timeout;
        let notice = message.action();
        let sent = tokio::select! {
            biased;
            () = self.cancel_token.cancelled() => return,
            sent = self.outbound.send_within(message, allowance) => sent,
        };

        match sent {
            Ok(()) | Err(SendFailure::Closed) => {}
            Err(SendFailure::Stalled) => {
                self.mailbox.record_drop();
                warn!(
                    target: "sfu.actor.peer",
                    peer_id = %self.peer_id,
                    notice,
                    stall_timeout = ?allowance,
                    "Client stopped reading, disconnecting"
                );
                self.cancel_token.cancel();
            }
        }
    }

    /// Best-effort delivery of notices still queued at teardown, so a room
    /// ended by shutdown is still announced.
    fn flush_room_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            let Some(joined) = &self.room else {
                return;
            };
            if event.generation() != joined.generation {
                continue;
            }
            let message = match event {
                RoomEvent::Notify { message, .. } => message,
                RoomEvent::RoomEnded { .. } => ServerMessage::RoomEnded {
                    room_id: joined.room_id.clone(),
                },
                RoomEvent::FlowsClosed { .. } => continue,
            };
            if self.outbound.try_send(message).is_err() {
                return;
            }
        }
    }

    /// Close one engine handle, logging failures.
    pub(super) async fn release(&self, resource: MediaResource) {
        if let Err(e) = self.context.media.close(&resource).await {
            warn!(
                target: "sfu.actor.peer",
                peer_id = %self.peer_id,
                resource = resource.kind(),
                error = %e,
                "Failed to release media handle"
            );
        }
    }

    /// Close every engine handle this peer holds: producers, then consumers,
    /// then the transports carrying them.
    pub(super) async fn release_media(&mut self) {
        let producers: Vec<_> = self.producers.drain().map(|(id, _)| id).collect();
        for producer in producers {
            self.release(MediaResource::Producer(producer)).await;
        }
        let consumers: Vec<_> = self.consumers.drain().map(|(_, c)| c.id).collect();
        for consumer in consumers {
            self.release(MediaResource::Consumer(consumer)).await;
        }
        for transport in [self.send_transport.take(), self.recv_transport.take()]
            .into_iter()
            .flatten()
        {
            self.release(MediaResource::Transport(transport.id)).await;
        }
    }

    /// Release handles, leave the room, and remove the room if it is now empty.
    async fn teardown(&mut self) {
        if self.lifecycle == PeerLifecycle::Closed {
            return;
        }
        self.lifecycle = PeerLifecycle::Closing;

        self.flush_room_events();
        let joined = self.room.take();
        self.release_media().await;

        if let Some(joined) = joined {
            match joined.handle.leave(self.peer_id).await {
                Ok(outcome) => {
                    debug!(
                        target: "sfu.actor.peer",
                        peer_id = %self.peer_id,
                        room_id = %joined.room_id,
                        was_member = outcome.was_member,
                        remaining = outcome.remaining,
                        "Left room"
                    );
                    if outcome.remaining == 0 {
                        if let Err(e) = self
                            .context
                            .registry
                            .remove_room_if_empty(joined.room_id.clone())
                            .await
                        {
                            debug!(
                                target: "sfu.actor.peer",
                                peer_id = %self.peer_id,
                                room_id = %joined.room_id,
                                error = %e,
                                "Room removal skipped"
                            );
                        }
                    }
                }
                Err(e) => {
                    // Room already stopped and released its state.
                    debug!(
                        target: "sfu.actor.peer",
                        peer_id = %self.peer_id,
                        room_id = %joined.room_id,
                        error = %e,
                        "Room gone before leave"
                    );
                }
            }
        }

        self.lifecycle = PeerLifecycle::Closed;
        self.context.metrics.connection_closed();
    }
}
