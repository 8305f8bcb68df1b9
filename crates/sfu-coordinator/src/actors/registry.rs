//! `RoomRegistryActor` - singleton owner of the room map.
//!
//! - Creates a room (and its routing context) on first join; concurrent first
//!   joins wait on one pending creation so exactly one routing context is
//!   created
//! - Removes a room once its last peer has left
//! - Force-ends rooms on `endRoom`
//! - Owns the root `CancellationToken` and monitors room tasks for panics
//!
//! A room id is present in the registry iff its room has at least one peer,
//! apart from the instant between the last leave and the removal request.
//!
//! The registry never awaits the media engine. Routing contexts are created
//! by a spawned task that reports back through an internal channel, and
//! closed by the room task after it has been removed. Removal and `endRoom`
//! are answered once that room task has finished.
//!
//! # Graceful Shutdown
//!
//! 1. Stop accepting new rooms
//! 2. Cancel the root token (rooms and peer sessions observe it)
//! 3. Wait for room tasks, bounded by the deadline

use crate::errors::SfuError;
use crate::media::{default_codecs, CodecCapability, MediaError, MediaGateway, RouterHandle};

use super::messages::{JoinOutcome, RegistryMessage, RegistryStatus, RoomInfo, RoomMember};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle};
use crate::observability::metrics::record_room_event;

use common::types::RoomId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long removal waits for a room task before giving up on it.
const ROOM_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Limits applied by the registry.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Identifier used in logs.
    pub instance_id: String,
    pub max_rooms: usize,
    pub max_peers_per_room: usize,
    /// Codecs every routing context is created with.
    pub codecs: Vec<CodecCapability>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            instance_id: "sfu-local".to_string(),
            max_rooms: 1000,
            max_peers_per_room: 100,
            codecs: default_codecs(),
        }
    }
}

/// Handle to the `RoomRegistryActor`.
#[derive(Clone)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomRegistryHandle {
    /// Spawn the registry and return a handle to it.
    #[must_use]
    pub fn new(settings: RegistrySettings, media: MediaGateway, metrics: Arc<ActorMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Registry,
            &settings.instance_id,
        ));

        let actor = RoomRegistryActor::new(
            settings,
            receiver,
            cancel_token.clone(),
            media,
            metrics,
            Arc::clone(&mailbox),
        );
        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            mailbox,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryMessage,
    ) -> Result<T, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if let Err(e) = self.sender.send(build(tx)).await {
            self.mailbox.cancel_enqueue();
            return Err(SfuError::Internal(format!("channel send failed: {e}")));
        }
        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Join `room_id`, creating the room if it does not exist.
    pub async fn join_room(
        &self,
        room_id: RoomId,
        member: RoomMember,
    ) -> Result<JoinOutcome, SfuError> {
        self.request(|respond_to| RegistryMessage::JoinRoom {
            room_id,
            member,
            respond_to,
        })
        .await?
    }

    /// Remove `room_id` if it has no peers. `Ok(true)` if it was removed.
    pub async fn remove_room_if_empty(&self, room_id: RoomId) -> Result<bool, SfuError> {
        self.request(|respond_to| RegistryMessage::RemoveRoomIfEmpty {
            room_id,
            respond_to,
        })
        .await?
    }

    /// Force-end `room_id`. Ending an absent room succeeds.
    pub async fn end_room(&self, room_id: RoomId) -> Result<(), SfuError> {
        self.request(|respond_to| RegistryMessage::EndRoom {
            room_id,
            respond_to,
        })
        .await?
    }

    pub async fn get_room(&self, room_id: RoomId) -> Result<RoomInfo, SfuError> {
        self.request(|respond_to| RegistryMessage::GetRoom {
            room_id,
            respond_to,
        })
        .await?
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, SfuError> {
        self.request(|respond_to| RegistryMessage::GetStatus { respond_to })
            .await
    }

    /// Stop accepting rooms, close every room and wait up to `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), SfuError> {
        self.request(|respond_to| RegistryMessage::Shutdown {
            deadline,
            respond_to,
        })
        .await?
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Child token for peer sessions, so process shutdown reaches them.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

struct ManagedRoom {
    handle: RoomActorHandle,
    router: RouterHandle,
    task_handle: JoinHandle<()>,
    created_at: i64,
}

/// A join waiting for its room's routing context.
struct PendingJoin {
    member: RoomMember,
    respond_to: oneshot::Sender<Result<JoinOutcome, SfuError>>,
}

/// Result of a routing context creation, reported by the creating task.
struct RoutingContextCreated {
    room_id: RoomId,
    result: Result<RouterHandle, MediaError>,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    settings: RegistrySettings,
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    media: MediaGateway,
    rooms: HashMap<RoomId, ManagedRoom>,
    /// Rooms whose routing context is being created, with their waiting joins.
    pending: HashMap<RoomId, Vec<PendingJoin>>,
    created_tx: mpsc::UnboundedSender<RoutingContextCreated>,
    created_rx: mpsc::UnboundedReceiver<RoutingContextCreated>,
    /// Last generation handed to a room.
    generation: u64,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomRegistryActor {
    fn new(
        settings: RegistrySettings,
        receiver: mpsc::Receiver<RegistryMessage>,
        cancel_token: CancellationToken,
        media: MediaGateway,
        metrics: Arc<ActorMetrics>,
        mailbox: Arc<MailboxMonitor>,
    ) -> Self {
        let (created_tx, created_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            receiver,
            cancel_token,
            media,
            rooms: HashMap::new(),
            pending: HashMap::new(),
            created_tx,
            created_rx,
            generation: 0,
            accepting_new: true,
            metrics,
            mailbox,
        }
    }

    #[instrument(skip_all, name = "sfu.actor.registry", fields(instance_id = %self.settings.instance_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.registry",
            instance_id = %self.settings.instance_id,
            max_rooms = self.settings.max_rooms,
            "RoomRegistryActor started"
        );

        loop {
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.registry",
                        instance_id = %self.settings.instance_id,
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown(Duration::from_secs(30)).await;
                    break;
                }

                Some(created) = self.created_rx.recv() => {
                    self.finish_creation(created).await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let stop = self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                            if stop {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "sfu.actor.registry",
                                instance_id = %self.settings.instance_id,
                                "RoomRegistryActor channel closed, exiting"
                            );
                            self.graceful_shutdown(Duration::from_secs(30)).await;
                            break;
                        }
                    }
                }
            }
        }

        // Creations still running see the closed channel and release their
        // own routing context.
        self.created_rx.close();
        while let Ok(created) = self.created_rx.try_recv() {
            if let Ok(router) = created.result {
                self.release_router(router);
            }
        }

        info!(
            target: "sfu.actor.registry",
            instance_id = %self.settings.instance_id,
            messages_processed = self.mailbox.messages_processed(),
            peak_mailbox_depth = self.mailbox.peak_depth(),
            "RoomRegistryActor stopped"
        );
    }

    /// Returns `true` when the actor should stop.
    async fn handle_message(&mut self, message: RegistryMessage) -> bool {
        match message {
            RegistryMessage::JoinRoom {
                room_id,
                member,
                respond_to,
            } => {
                self.join_room(room_id, member, respond_to).await;
            }
            RegistryMessage::RemoveRoomIfEmpty {
                room_id,
                respond_to,
            } => {
                self.remove_room_if_empty(room_id, respond_to).await;
            }
            RegistryMessage::EndRoom {
                room_id,
                respond_to,
            } => {
                self.end_room(room_id, respond_to).await;
            }
            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let result = self.get_room(&room_id).await;
                let _ = respond_to.send(result);
            }
            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }
            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                self.graceful_shutdown(deadline).await;
                self.cancel_token.cancel();
                let _ = respond_to.send(Ok(()));
                return true;
            }
        }
        false
    }

    async fn join_room(
        &mut self,
        room_id: RoomId,
        member: RoomMember,
        respond_to: oneshot::Sender<Result<JoinOutcome, SfuError>>,
    ) {
        if let Some(managed) = self.rooms.get(&room_id) {
            let handle = managed.handle.clone();
            let router = managed.router.clone();
            match handle.join(member.clone()).await {
                Ok(existing_flows) => {
                    let _ = respond_to.send(Ok(JoinOutcome {
                        generation: handle.generation(),
                        router,
                        room: handle,
                        existing_flows,
                        created: false,
                    }));
                    return;
                }
                Err(SfuError::RoomClosed(_)) => {
                    // Room stopped without being removed; replace it.
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Stale room entry replaced"
                    );
                    self.forget_room(&room_id);
                }
                Err(e) => {
                    let _ = respond_to.send(Err(e));
                    return;
                }
            }
        }

        if let Some(waiting) = self.pending.get_mut(&room_id) {
            waiting.push(PendingJoin { member, respond_to });
            return;
        }

        if !self.accepting_new {
            let _ = respond_to.send(Err(SfuError::ShuttingDown));
            return;
        }
        if self.rooms.len() + self.pending.len() >= self.settings.max_rooms {
            warn!(
                target: "sfu.actor.registry",
                max_rooms = self.settings.max_rooms,
                "Room limit reached, rejecting new room"
            );
            let _ = respond_to.send(Err(SfuError::ServerCapacityExceeded));
            return;
        }

        self.pending
            .insert(room_id.clone(), vec![PendingJoin { member, respond_to }]);
        self.begin_creation(room_id);
    }

    /// Create the routing context for `room_id` off the actor loop.
    fn begin_creation(&self, room_id: RoomId) {
        debug!(
            target: "sfu.actor.registry",
            room_id = %room_id,
            "Creating routing context"
        );
        let media = self.media.clone();
        let codecs = self.settings.codecs.clone();
        let created_tx = self.created_tx.clone();
        tokio::spawn(async move {
            let result = media.create_routing_context(&codecs).await;
            if let Err(unclaimed) = created_tx.send(RoutingContextCreated { room_id, result }) {
                if let Ok(router) = unclaimed.0.result {
                    close_router(&media, router).await;
                }
            }
        });
    }

    /// Spawn the room for a finished creation and admit the joins waiting on it.
    async fn finish_creation(&mut self, created: RoutingContextCreated) {
        let RoutingContextCreated { room_id, result } = created;
        let Some(waiting) = self.pending.remove(&room_id) else {
            if let Ok(router) = result {
                self.release_router(router);
            }
            return;
        };

        let router = match result {
            Ok(router) => router,
            Err(e) => {
                warn!(
                    target: "sfu.actor.registry",
                    room_id = %room_id,
                    error = %e,
                    waiting = waiting.len(),
                    "Routing context creation failed"
                );
                for join in waiting {
                    let _ = join
                        .respond_to
                        .send(Err(SfuError::media("createRoutingContext", e.clone())));
                }
                return;
            }
        };

        if !self.accepting_new {
            self.release_router(router);
            for join in waiting {
                let _ = join.respond_to.send(Err(SfuError::ShuttingDown));
            }
            return;
        }

        self.generation += 1;
        let generation = self.generation;
        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            generation,
            router.clone(),
            self.media.clone(),
            self.settings.max_peers_per_room,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                router: router.clone(),
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        self.metrics.room_created();
        record_room_event("created");

        info!(
            target: "sfu.actor.registry",
            room_id = %room_id,
            generation = generation,
            router_id = %router.id,
            waiting = waiting.len(),
            total_rooms = self.rooms.len(),
            "Room created"
        );

        let mut admitted = 0;
        for (position, join) in waiting.into_iter().enumerate() {
            if join.respond_to.is_closed() {
                continue;
            }
            let peer_id = join.member.peer_id;
            let result = handle.join(join.member).await.map(|existing_flows| JoinOutcome {
                room: handle.clone(),
                generation,
                router: router.clone(),
                existing_flows,
                created: position == 0,
            });
            match join.respond_to.send(result) {
                Ok(()) => {}
                Err(Ok(_)) => {
                    // Requester went away after being admitted.
                    let _ = handle.leave(peer_id).await;
                    continue;
                }
                Err(Err(_)) => continue,
            }
            admitted += 1;
        }

        if admitted == 0 {
            // A room nobody could join must not linger.
            let _ = handle.close_if_empty().await;
            self.stop_room(&room_id, None::<(oneshot::Sender<()>, ())>);
        }
    }

    async fn remove_room_if_empty(
        &mut self,
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<bool, SfuError>>,
    ) {
        let Some(managed) = self.rooms.get(&room_id) else {
            let _ = respond_to.send(Ok(false));
            return;
        };
        match managed.handle.close_if_empty().await {
            Ok(true) | Err(SfuError::RoomClosed(_)) => {
                self.stop_room(&room_id, Some((respond_to, Ok(true))));
                record_room_event("emptied");
                info!(
                    target: "sfu.actor.registry",
                    room_id = %room_id,
                    total_rooms = self.rooms.len(),
                    "Room removed after last peer left"
                );
            }
            Ok(false) => {
                debug!(
                    target: "sfu.actor.registry",
                    room_id = %room_id,
                    "Room still has peers, keeping it"
                );
                let _ = respond_to.send(Ok(false));
            }
            Err(e) => {
                let _ = respond_to.send(Err(e));
            }
        }
    }

    async fn end_room(&mut self, room_id: RoomId, respond_to: oneshot::Sender<Result<(), SfuError>>) {
        let Some(managed) = self.rooms.remove(&room_id) else {
            debug!(
                target: "sfu.actor.registry",
                room_id = %room_id,
                "endRoom for absent room"
            );
            let _ = respond_to.send(Ok(()));
            return;
        };
        self.metrics.room_removed();
        record_room_event("ended");

        if let Err(e) = managed.handle.end().await {
            debug!(
                target: "sfu.actor.registry",
                room_id = %room_id,
                error = %e,
                "Room already stopped when ended"
            );
        }

        info!(
            target: "sfu.actor.registry",
            room_id = %room_id,
            total_rooms = self.rooms.len(),
            "Room ended"
        );
        self.await_room_task(room_id, managed.task_handle, Some((respond_to, Ok(()))));
    }

    /// Drop the entry and wait for the room task in the background, then
    /// send `reply` if given.
    fn stop_room<T: Send + 'static>(
        &mut self,
        room_id: &RoomId,
        reply: Option<(oneshot::Sender<T>, T)>,
    ) {
        match self.rooms.remove(room_id) {
            Some(managed) => {
                self.metrics.room_removed();
                self.await_room_task(room_id.clone(), managed.task_handle, reply);
            }
            None => {
                if let Some((respond_to, value)) = reply {
                    let _ = respond_to.send(value);
                }
            }
        }
    }

    /// Drop the entry of a room whose task already ended.
    fn forget_room(&mut self, room_id: &RoomId) {
        if let Some(managed) = self.rooms.remove(room_id) {
            self.metrics.room_removed();
            managed.task_handle.abort();
        }
    }

    /// Wait for a stopping room task off the actor loop. The room closes its
    /// routing context before the task ends, so `reply` is sent only once
    /// the context is gone.
    fn await_room_task<T: Send + 'static>(
        &self,
        room_id: RoomId,
        task_handle: JoinHandle<()>,
        reply: Option<(oneshot::Sender<T>, T)>,
    ) {
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_STOP_TIMEOUT, task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room task completed cleanly"
                    );
                }
                Ok(Err(e)) if e.is_panic() => {
                    error!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room task panicked during removal"
                    );
                    metrics.record_panic(ActorType::Room);
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room task did not stop in time"
                    );
                }
            }
            if let Some((respond_to, value)) = reply {
                let _ = respond_to.send(value);
            }
        });
    }

    /// Close a routing context no room was built on, off the actor loop.
    fn release_router(&self, router: RouterHandle) {
        let media = self.media.clone();
        tokio::spawn(async move {
            close_router(&media, router).await;
        });
    }

    async fn get_room(&self, room_id: &RoomId) -> Result<RoomInfo, SfuError> {
        let managed = self
            .rooms
            .get(room_id)
            .ok_or_else(|| SfuError::RoomNotFound(room_id.to_string()))?;
        let state = managed.handle.get_state().await?;
        Ok(RoomInfo {
            room_id: room_id.clone(),
            generation: state.generation,
            peer_count: state.peers.len(),
            flow_count: state.flows.len(),
            created_at: managed.created_at,
        })
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.rooms.len(),
            connection_count: self.metrics.connection_count(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    async fn graceful_shutdown(&mut self, deadline: Duration) {
        info!(
            target: "sfu.actor.registry",
            instance_id = %self.settings.instance_id,
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for (room_id, waiting) in self.pending.drain() {
            debug!(
                target: "sfu.actor.registry",
                room_id = %room_id,
                waiting = waiting.len(),
                "Abandoning room creation"
            );
            for join in waiting {
                let _ = join.respond_to.send(Err(SfuError::ShuttingDown));
            }
        }

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        let rooms: Vec<_> = self.rooms.drain().collect();
        for (room_id, managed) in rooms {
            self.metrics.room_removed();
            match tokio::time::timeout(deadline, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
        }

        info!(
            target: "sfu.actor.registry",
            instance_id = %self.settings.instance_id,
            "Graceful shutdown complete"
        );
    }

    /// Drop rooms whose task ended on its own (panic or unexpected exit).
    async fn check_room_health(&mut self) {
        let finished: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };
            self.metrics.room_removed();
            match managed.task_handle.await {
                Ok(()) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room actor exited without being removed"
                    );
                }
                Err(join_error) if join_error.is_panic() => {
                    error!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        error = ?join_error,
                        "Room actor panicked"
                    );
                    self.metrics.record_panic(ActorType::Room);
                }
                Err(_) => {}
            }
        }
    }
}

#[cfg(test)]
impl RoomRegistryHandle {
    /// A handle whose requests are answered by the caller instead of an actor.
    pub(crate) fn scripted() -> (Self, mpsc::Receiver<RegistryMessage>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let handle = Self {
            sender,
            cancel_token: CancellationToken::new(),
            mailbox: Arc::new(MailboxMonitor::new(ActorType::Registry, "scripted")),
        };
        (handle, receiver)
    }
}

async fn close_router(media: &MediaGateway, router: RouterHandle) {
    if let Err(e) = media.close_routing_context(&router.id).await {
        warn!(
            target: "sfu.actor.registry",
            router_id = %router.id,
            error = %e,
            "Failed to close unused routing context"
        );
    }
}
