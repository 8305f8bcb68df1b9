//! Liveness and readiness probes.
//!
//! `GET /health` answers 200 for as long as the process serves HTTP.
//! `GET /ready` answers 200 only in [`Phase::Serving`] and names the current
//! phase in its body so a failing probe says why.
//!
//! `/metrics` is mounted next to these by `main` from the Prometheus handle.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Where the process is in its lifetime. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Phase {
    /// Signaling listener not bound yet.
    Starting = 0,
    Serving = 1,
    /// Shutdown has begun; existing sessions are being closed.
    Draining = 2,
}

impl Phase {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Phase::Starting,
            1 => Phase::Serving,
            _ => Phase::Draining,
        }
    }
}

#[derive(Debug)]
pub struct HealthState {
    phase: AtomicU8,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Starting as u8),
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// The signaling listener is bound. Ignored once draining.
    pub fn set_ready(&self) {
        self.advance(Phase::Serving);
    }

    pub fn start_draining(&self) {
        self.advance(Phase::Draining);
    }

    /// Answering HTTP at all means the process is live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        true
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Serving
    }

    fn advance(&self, to: Phase) {
        self.phase.fetch_max(to as u8, Ordering::SeqCst);
    }
}

#[derive(Debug, Serialize)]
struct ReadinessBody {
    phase: Phase,
}

/// Router serving `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<ReadinessBody>) {
    let phase = state.phase();
    let status = if phase == Phase::Serving {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessBody { phase }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn probe(state: Arc<HealthState>, path: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .uri(path)
            .body(Body::empty())
            .expect("Failed to build request");
        let response = health_router(state)
            .oneshot(request)
            .await
            .expect("Failed to execute request");
        let status = response.status();
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        (status, body.to_vec())
    }

    #[test]
    fn test_phases_only_move_forward() {
        let state = HealthState::new();
        assert_eq!(state.phase(), Phase::Starting);
        assert!(!state.is_ready(), "Should not be ready before listener bind");

        state.set_ready();
        assert_eq!(state.phase(), Phase::Serving);
        assert!(state.is_ready());

        state.start_draining();
        state.set_ready();
        assert_eq!(state.phase(), Phase::Draining, "Draining is permanent");
        assert!(!state.is_ready());
        assert!(state.is_live());
    }

    #[tokio::test]
    async fn test_liveness_endpoint() {
        let state = Arc::new(HealthState::new());
        state.start_draining();
        assert_eq!(probe(state, "/health").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_reports_phase() {
        let state = Arc::new(HealthState::new());
        let (status, body) = probe(Arc::clone(&state), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, br#"{"phase":"starting"}"#);

        state.set_ready();
        let (status, body) = probe(Arc::clone(&state), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, br#"{"phase":"serving"}"#);

        state.start_draining();
        let (status, body) = probe(state, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, br#"{"phase":"draining"}"#);
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let state = Arc::new(HealthState::new());
        assert_eq!(probe(state, "/unknown").await.0, StatusCode::NOT_FOUND);
    }
}
