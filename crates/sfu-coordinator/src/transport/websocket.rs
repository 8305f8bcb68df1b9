//! WebSocket endpoint.
//!
//! Each connection gets a `PeerSessionActor`. A writer task drains the
//! session's outbound queue into text frames; the reader loop decodes
//! incoming frames and forwards them to the session in arrival order.

use crate::actors::{ActorType, PeerContext, PeerSessionActor, PeerSessionHandle, SpawnedPeer};
use crate::errors::SfuError;
use crate::signaling::{decode_client_message, encode_server_message, DecodeFailure, ServerMessage};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use common::types::PeerId;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// How long queued replies may take to flush after the session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared state for the signaling endpoint.
#[derive(Clone)]
pub struct SignalingState {
    pub context: PeerContext,
}

impl SignalingState {
    #[must_use]
    pub fn new(context: PeerContext) -> Self {
        Self { context }
    }
}

/// Router serving `GET /ws`.
pub fn signaling_router(state: SignalingState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<SignalingState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SignalingState) {
    let peer_id = PeerId::new();
    let SpawnedPeer {
        handle,
        task,
        outbound,
    } = PeerSessionActor::spawn(peer_id, state.context.clone());

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_frames(peer_id, sink, outbound));

    info!(target: "sfu.transport.ws", peer_id = %peer_id, "WebSocket connected");

    loop {
        let frame = tokio::select! {
            () = handle.cancelled() => {
                debug!(target: "sfu.transport.ws", peer_id = %peer_id, "Session cancelled, closing socket");
                break;
            }
            frame = stream.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            None => break,
            Some(Err(e)) => {
                debug!(
                    target: "sfu.transport.ws",
                    peer_id = %peer_id,
                    error = %e,
                    "WebSocket read failed"
                );
                break;
            }
        };

        let forwarded = match frame {
            Message::Text(text) => forward(&handle, &text).await,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => forward(&handle, &text).await,
                Err(_) => {
                    handle
                        .malformed(DecodeFailure {
                            request: None,
                            error: SfuError::MalformedMessage(
                                "binary frame is not valid UTF-8".to_string(),
                            ),
                        })
                        .await
                }
            },
            Message::Close(_) => {
                debug!(target: "sfu.transport.ws", peer_id = %peer_id, "Close frame received");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if let Err(e) = forwarded {
            warn!(
                target: "sfu.transport.ws",
                peer_id = %peer_id,
                error = %e,
                "Peer session no longer accepting frames"
            );
            break;
        }
    }

    handle.close();
    if let Err(e) = task.await {
        if e.is_panic() {
            error!(
                target: "sfu.actor.panic",
                peer_id = %peer_id,
                "PeerSessionActor panicked"
            );
            state.context.metrics.record_panic(ActorType::Peer);
        }
    }
    // The queue closes once the session and its room membership are gone.
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    info!(target: "sfu.transport.ws", peer_id = %peer_id, "WebSocket disconnected");
}

/// Decode one frame and hand it to the session. Undecodable frames are
/// handed over too, so their `error` replies keep arrival order.
async fn forward(handle: &PeerSessionHandle, text: &str) -> Result<(), SfuError> {
    match decode_client_message(text) {
        Ok(message) => handle.client_message(message).await,
        Err(failure) => handle.malformed(failure).await,
    }
}

async fn write_frames(
    peer_id: PeerId,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let text = match encode_server_message(&message) {
            Ok(text) => text,
            Err(e) => {
                error!(
                    target: "sfu.transport.ws",
                    peer_id = %peer_id,
                    action = message.action(),
                    error = %e,
                    "Failed to encode outbound message"
                );
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
    debug!(target: "sfu.transport.ws", peer_id = %peer_id, "Writer task ended");
}
