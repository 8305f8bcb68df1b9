//! SFU Coordinator
//!
//! Signaling server for a selective-forwarding media server.
//!
//! # Servers
//!
//! - WebSocket server for client signaling (default: 0.0.0.0:3000)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing and the Prometheus metrics recorder
//! 3. Create the media engine and the room registry
//! 4. Start health HTTP server (liveness, readiness, metrics)
//! 5. Start the signaling server and mark ready
//! 6. Wait for shutdown signal, drain, shut the registry down

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use common::config::ObservabilityConfig;
use sfu_coordinator::actors::{
    ActorMetrics, PeerContext, PeerSettings, RegistrySettings, RoomRegistryHandle,
};
use sfu_coordinator::config::Config;
use sfu_coordinator::media::{default_codecs, LoopbackEngine, MediaGateway};
use sfu_coordinator::observability::{health_router, init_metrics_recorder, HealthState};
use sfu_coordinator::transport::{signaling_router, SignalingState};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Upper bound on closing every room at shutdown.
const REGISTRY_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration decides the log format, so it is read first and
    // reported once tracing is up.
    let config = Config::from_env();
    let observability = config
        .as_ref()
        .map(|c| c.observability.clone())
        .unwrap_or_default();
    init_tracing(&observability);

    info!("Starting SFU Coordinator");

    let config = config.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        sfu_id = %config.sfu_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        max_rooms = config.max_rooms,
        max_peers_per_room = config.max_peers_per_room,
        media_call_timeout_ms = config.media_call_timeout.as_millis(),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // Media engine and actor system
    let engine = Arc::new(LoopbackEngine::new(config.announced_ip.clone()));
    let media = MediaGateway::new(engine, config.media_call_timeout);
    let actor_metrics = ActorMetrics::new();
    let registry = RoomRegistryHandle::new(
        RegistrySettings {
            instance_id: config.sfu_id.clone(),
            max_rooms: config.max_rooms,
            max_peers_per_room: config.max_peers_per_room,
            codecs: default_codecs(),
        },
        media.clone(),
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    // Servers stop on this token; the registry is shut down separately.
    let shutdown_token = registry.child_token();

    // Health server (liveness, readiness, /metrics)
    let health_addr = config.health_bind_address;
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let signaling_addr = config.signaling_bind_address;
    let signaling_app = signaling_router(SignalingState::new(PeerContext {
        registry: registry.clone(),
        media,
        settings: PeerSettings {
            announced_ip: config.announced_ip.clone(),
            outbound_buffer: config.outbound_buffer,
            outbound_stall_timeout: config.outbound_stall_timeout,
        },
        metrics: Arc::clone(&actor_metrics),
    }));

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("SFU Coordinator running - press Ctrl+C to shutdown");

    if let Err(e) = shutdown_signal().await {
        error!(error = %e, "Failed to listen for shutdown signals, shutting down");
    } else {
        info!("Shutdown signal received, draining");
    }

    // Stop advertising readiness so load balancers stop sending traffic
    health_state.start_draining();
    shutdown_token.cancel();

    // Cancels every room and peer session via the root token
    if let Err(e) = registry.shutdown(REGISTRY_SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Actor system shutdown error");
    }

    info!(
        open_connections = actor_metrics.connection_count(),
        "SFU Coordinator shutdown complete"
    );

    Ok(())
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&observability.log_filter));
    let registry = tracing_subscriber::registry().with(filter);

    if observability.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}
