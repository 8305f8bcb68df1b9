//! Coordinator harness and canned client payloads.

use serde_json::{json, Value};
use sfu_coordinator::actors::{
    ActorMetrics, PeerContext, PeerSettings, RegistrySettings, RegistryStatus, RoomRegistryHandle,
};
use sfu_coordinator::media::MediaGateway;
use std::sync::Arc;
use std::time::Duration;

use crate::mock_media::MockMediaEngine;
use crate::test_peer::TestPeer;

/// Media call timeout used unless a test picks its own.
pub const TEST_MEDIA_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// A registry plus everything needed to open peer sessions against it.
///
/// Must be created inside a Tokio runtime.
pub struct TestCoordinator {
    pub engine: Arc<MockMediaEngine>,
    pub registry: RoomRegistryHandle,
    pub metrics: Arc<ActorMetrics>,
    pub context: PeerContext,
}

impl TestCoordinator {
    /// Default limits, healthy engine.
    #[must_use]
    pub fn new() -> Self {
        Self::with_engine(MockMediaEngine::healthy())
    }

    #[must_use]
    pub fn with_engine(engine: Arc<MockMediaEngine>) -> Self {
        Self::build(engine, RegistrySettings::default(), TEST_MEDIA_CALL_TIMEOUT)
    }

    #[must_use]
    pub fn build(
        engine: Arc<MockMediaEngine>,
        settings: RegistrySettings,
        media_call_timeout: Duration,
    ) -> Self {
        let media = MediaGateway::new(engine.clone(), media_call_timeout);
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(settings, media.clone(), Arc::clone(&metrics));
        let context = PeerContext {
            registry: registry.clone(),
            media,
            settings: PeerSettings::default(),
            metrics: Arc::clone(&metrics),
        };
        Self {
            engine,
            registry,
            metrics,
            context,
        }
    }

    /// Use `settings` for sessions opened from now on.
    #[must_use]
    pub fn with_peer_settings(mut self, settings: PeerSettings) -> Self {
        self.context.settings = settings;
        self
    }

    /// Open a new peer session.
    #[must_use]
    pub fn connect(&self) -> TestPeer {
        TestPeer::spawn(self.context.clone())
    }

    pub async fn status(&self) -> RegistryStatus {
        self.registry
            .get_status()
            .await
            .expect("registry stopped")
    }
}

impl Default for TestCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// DTLS parameters accepted by the engine.
#[must_use]
pub fn dtls_parameters() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD:EF:01:23:45" }]
    })
}

#[must_use]
pub fn opus_rtp_parameters() -> Value {
    json!({
        "codecs": [{ "mimeType": "audio/opus", "clockRate": 48000, "channels": 2, "payloadType": 111 }],
        "encodings": [{ "ssrc": 1111 }]
    })
}

#[must_use]
pub fn vp8_rtp_parameters() -> Value {
    json!({
        "codecs": [{ "mimeType": "video/VP8", "clockRate": 90000, "payloadType": 96 }],
        "encodings": [{ "ssrc": 2222 }]
    })
}

/// Receiver capabilities able to decode audio and video.
#[must_use]
pub fn rtp_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
        ]
    })
}

/// Receiver capabilities that only decode audio.
#[must_use]
pub fn audio_only_capabilities() -> Value {
    json!({
        "codecs": [{ "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 }]
    })
}
