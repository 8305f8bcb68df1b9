//! Client request handlers for `PeerSessionActor`.
//!
//! Every handler either replies or fails with an [`SfuError`]; `dispatch`
//! turns failures into `error` messages for the request that caused them.

use crate::errors::SfuError;
use crate::media::{MediaKind, MediaResource, TransportDirection, TransportOptions};
use crate::observability::metrics::{record_message_latency, record_rejection};
use crate::signaling::{ClientMessage, ConsumerParams, ServerMessage, TransportParams};

use super::messages::{FlowRecord, RoomMember};
use super::peer::{JoinedRoom, PeerSessionActor};

use common::types::{RoomId, TransportId};
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info, warn};

impl PeerSessionActor {
    pub(super) async fn dispatch(&mut self, message: ClientMessage) {
        let action = message.action();
        let started = Instant::now();

        let result = match message {
            ClientMessage::JoinRoom { room_id } => self.join_room(room_id).await,
            ClientMessage::GetRouterRtpCapabilities => self.router_capabilities().await,
            ClientMessage::CreateSendTransport => {
                self.create_transport(TransportDirection::Send).await
            }
            ClientMessage::CreateRecvTransport => {
                self.create_transport(TransportDirection::Recv).await
            }
            ClientMessage::ConnectTransport {
                id,
                dtls_parameters,
            } => self.connect_transport(id, dtls_parameters).await,
            ClientMessage::Produce {
                kind,
                rtp_parameters,
            } => self.produce(kind, rtp_parameters).await,
            ClientMessage::Consume { rtp_capabilities } => self.consume(rtp_capabilities).await,
            ClientMessage::EndRoom => self.end_room().await,
        };

        if let Err(e) = result {
            self.reject(Some(action), &e).await;
        }

        record_message_latency(action, started.elapsed());
    }

    /// Send an `error` reply for `request`. Cancelled requests get no reply.
    pub(super) async fn reject(&self, request: Option<&str>, error: &SfuError) {
        if matches!(error, SfuError::Cancelled) {
            return;
        }

        let code = error.error_code();
        match error {
            SfuError::Media { .. } | SfuError::Internal(_) | SfuError::RoomClosed(_) => warn!(
                target: "sfu.actor.peer",
                peer_id = %self.peer_id,
                request = request.unwrap_or("-"),
                code,
                error = %error,
                "Request failed"
            ),
            _ => debug!(
                target: "sfu.actor.peer",
                peer_id = %self.peer_id,
                request = request.unwrap_or("-"),
                code,
                error = %error,
                "Request rejected"
            ),
        }

        record_rejection(code);
        self.reply(ServerMessage::rejection(request, error)).await;
    }

    fn joined(&self) -> Result<&JoinedRoom, SfuError> {
        self.room.as_ref().ok_or(SfuError::NotJoined)
    }

    async fn join_room(&mut self, room_id: String) -> Result<(), SfuError> {
        if let Some(joined) = &self.room {
            return Err(SfuError::AlreadyJoined(joined.room_id.to_string()));
        }
        let room_id =
            RoomId::parse(&room_id).map_err(|e| SfuError::InvalidRoomId(e.to_string()))?;

        let member = RoomMember {
            peer_id: self.peer_id,
            events: self.events_tx.clone(),
        };

        let outcome = self
            .context
            .registry
            .join_room(room_id.clone(), member)
            .await?;

        info!(
            target: "sfu.actor.peer",
            peer_id = %self.peer_id,
            room_id = %room_id,
            generation = outcome.generation,
            created = outcome.created,
            existing_flows = outcome.existing_flows.len(),
            "Joined room"
        );

        self.room = Some(JoinedRoom {
            room_id: room_id.clone(),
            generation: outcome.generation,
            handle: outcome.room,
            router: outcome.router,
        });

        // Room notices queued since the join are forwarded only after this
        // handler returns, so `roomJoined` always comes first.
        self.reply(ServerMessage::RoomJoined {
            room_id,
            peer_id: self.peer_id,
            existing_flows: outcome.existing_flows,
        })
        .await;
        Ok(())
    }

    async fn router_capabilities(&self) -> Result<(), SfuError> {
        let capabilities = self.joined()?.router.rtp_capabilities.clone();
        self.reply(ServerMessage::RouterRtpCapabilities { capabilities })
            .await;
        Ok(())
    }

    async fn create_transport(&mut self, direction: TransportDirection) -> Result<(), SfuError> {
        let router = self.joined()?.router.id.clone();
        let existing = match direction {
            TransportDirection::Send => &self.send_transport,
            TransportDirection::Recv => &self.recv_transport,
        };
        if existing.is_some() {
            return Err(SfuError::Conflict(format!(
                "{} transport already exists",
                direction.as_str()
            )));
        }

        let options = TransportOptions::new(direction, self.context.settings.announced_ip.clone());
        let transport = self
            .context
            .media
            .create_transport(&router, &options, &self.cancel_token)
            .await
            .map_err(|e| SfuError::media("createTransport", e))?;

        debug!(
            target: "sfu.actor.peer",
            peer_id = %self.peer_id,
            transport_id = %transport.id,
            direction = direction.as_str(),
            "Transport created"
        );

        let params = TransportParams::from(&transport);
        let reply = match direction {
            TransportDirection::Send => {
                self.send_transport = Some(transport);
                ServerMessage::CreateSendTransport { params }
            }
            TransportDirection::Recv => {
                self.recv_transport = Some(transport);
                ServerMessage::CreateRecvTransport { params }
            }
        };
        self.reply(reply).await;
        Ok(())
    }

    async fn connect_transport(
        &mut self,
        id: TransportId,
        dtls_parameters: Value,
    ) -> Result<(), SfuError> {
        self.joined()?;
        let owned = [&self.send_transport, &self.recv_transport]
            .into_iter()
            .flatten()
            .any(|transport| transport.id == id);
        if !owned {
            return Err(SfuError::UnknownTransport(id.to_string()));
        }

        self.context
            .media
            .connect_transport(&id, &dtls_parameters, &self.cancel_token)
            .await
            .map_err(|e| SfuError::media("connectTransport", e))?;

        self.reply(ServerMessage::TransportConnected { id }).await;
        Ok(())
    }

    async fn produce(&mut self, kind: MediaKind, rtp_parameters: Value) -> Result<(), SfuError> {
        let room = self.joined()?.handle.clone();
        let transport = self
            .send_transport
            .as_ref()
            .map(|t| t.id.clone())
            .ok_or(SfuError::TransportMissing("send"))?;

        let producer = self
            .context
            .media
            .produce(&transport, kind, &rtp_parameters, &self.cancel_token)
            .await
            .map_err(|e| SfuError::media("produce", e))?;

        let flow_id = producer.id.clone();
        if let Err(e) = room
            .add_flow(FlowRecord::new(self.peer_id, producer.clone()))
            .await
        {
            self.release(MediaResource::Producer(flow_id)).await;
            return Err(e);
        }

        info!(
            target: "sfu.actor.peer",
            peer_id = %self.peer_id,
            flow_id = %flow_id,
            kind = %kind,
            "Flow published"
        );

        self.producers.insert(flow_id.clone(), producer);
        self.reply(ServerMessage::Produced { id: flow_id }).await;
        Ok(())
    }

    /// Create a consumer for every flow the peer does not consume yet.
    ///
    /// A failure for one flow is reported for that flow and the rest are
    /// still attempted.
    async fn consume(&mut self, rtp_capabilities: Value) -> Result<(), SfuError> {
        let joined = self.joined()?.clone();
        let transport = self
            .recv_transport
            .as_ref()
            .map(|t| t.id.clone())
            .ok_or(SfuError::TransportMissing("recv"))?;

        let flows = joined.handle.consumable_flows(self.peer_id).await?;

        for flow in flows {
            if self.consumers.contains_key(&flow.flow_id) {
                continue;
            }

            match self
                .context
                .media
                .can_consume(
                    &joined.router.id,
                    &flow.flow_id,
                    &rtp_capabilities,
                    &self.cancel_token,
                )
                .await
                .map_err(|e| SfuError::media("canConsume", e))
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        target: "sfu.actor.peer",
                        peer_id = %self.peer_id,
                        flow_id = %flow.flow_id,
                        "Flow not consumable with these capabilities"
                    );
                    continue;
                }
                Err(SfuError::Cancelled) => return Err(SfuError::Cancelled),
                Err(e) => {
                    self.reject(Some("consume"), &e).await;
                    continue;
                }
            }

            let consumer = match self
                .context
                .media
                .consume(
                    &transport,
                    &flow.flow_id,
                    &rtp_capabilities,
                    &self.cancel_token,
                )
                .await
                .map_err(|e| SfuError::media("consume", e))
            {
                Ok(consumer) => consumer,
                Err(SfuError::Cancelled) => return Err(SfuError::Cancelled),
                Err(e) => {
                    self.reject(Some("consume"), &e).await;
                    continue;
                }
            };

            match joined
                .handle
                .record_consumer(self.peer_id, flow.flow_id.clone())
                .await
            {
                Ok(true) => {
                    let params = ConsumerParams::new(&consumer, flow.owner_peer_id);
                    self.consumers.insert(flow.flow_id.clone(), consumer);
                    self.reply(ServerMessage::Consuming { params }).await;
                }
                Ok(false) => {
                    // Recorded by an earlier request; this consumer is surplus.
                    self.release(MediaResource::Consumer(consumer.id)).await;
                }
                Err(e) => {
                    // Source flow unpublished while the consumer was created.
                    self.release(MediaResource::Consumer(consumer.id)).await;
                    self.reject(Some("consume"), &e).await;
                }
            }
        }

        Ok(())
    }

    async fn end_room(&mut self) -> Result<(), SfuError> {
        let room_id = self.joined()?.room_id.clone();

        info!(
            target: "sfu.actor.peer",
            peer_id = %self.peer_id,
            room_id = %room_id,
            "Ending room on request"
        );

        self.context.registry.end_room(room_id.clone()).await?;

        // The room's own `roomEnded` event for this peer is ignored from here.
        self.room = None;
        self.release_media().await;
        self.reply(ServerMessage::RoomEnded { room_id }).await;
        Ok(())
    }
}
