//! Guarded call path into the media engine.
//!
//! Every engine call goes through [`MediaGateway`] so that it is bounded by the
//! configured timeout, abandoned when the calling peer disconnects, and
//! measured. Release calls (`close`, `close_routing_context`) are not
//! cancellable: they run during teardown, after the peer token has fired.

use super::{
    CodecCapability, ConsumerHandle, MediaEngine, MediaError, MediaKind, MediaResource,
    ProducerHandle, RouterHandle, TransportDescriptor, TransportOptions,
};
use crate::observability::metrics::{record_media_call, record_media_exhausted};
use common::types::{FlowId, RouterId, TransportId};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Default per-call timeout.
pub const DEFAULT_MEDIA_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared handle to the media engine plus call policy.
#[derive(Clone)]
pub struct MediaGateway {
    engine: Arc<dyn MediaEngine>,
    call_timeout: Duration,
}

impl std::fmt::Debug for MediaGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaGateway")
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl MediaGateway {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>, call_timeout: Duration) -> Self {
        Self {
            engine,
            call_timeout,
        }
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Run one engine call under the timeout and (optionally) a cancellation token.
    async fn guarded<T, F>(
        &self,
        operation: &'static str,
        cancel: Option<&CancellationToken>,
        call: F,
    ) -> Result<T, MediaError>
    where
        F: Future<Output = Result<T, MediaError>>,
    {
        let start = Instant::now();
        let bounded = async {
            tokio::time::timeout(self.call_timeout, call)
                .await
                .unwrap_or(Err(MediaError::Timeout { operation }))
        };

        let result = match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    () = token.cancelled() => Err(MediaError::Cancelled),
                    result = bounded => result,
                }
            }
            None => bounded.await,
        };

        let status = match &result {
            Ok(_) => "success",
            Err(MediaError::Timeout { .. }) => "timeout",
            Err(MediaError::Cancelled) => "cancelled",
            Err(_) => "error",
        };
        record_media_call(operation, status, start.elapsed());

        match &result {
            Err(err) if err.is_exhaustion() => {
                error!(
                    target: "sfu.media",
                    operation = operation,
                    error = %err,
                    "Media engine out of resources"
                );
                record_media_exhausted(operation);
            }
            Err(err) => {
                debug!(target: "sfu.media", operation = operation, error = %err, "Media call failed");
            }
            Ok(_) => {}
        }

        result
    }

    /// Create a routing context. Not tied to any peer, so not cancellable.
    pub async fn create_routing_context(
        &self,
        codecs: &[CodecCapability],
    ) -> Result<RouterHandle, MediaError> {
        self.guarded(
            "createRoutingContext",
            None,
            self.engine.create_routing_context(codecs),
        )
        .await
    }

    pub async fn close_routing_context(&self, router: &RouterId) -> Result<(), MediaError> {
        self.guarded(
            "closeRoutingContext",
            None,
            self.engine.close_routing_context(router),
        )
        .await
    }

    pub async fn create_transport(
        &self,
        router: &RouterId,
        options: &TransportOptions,
        cancel: &CancellationToken,
    ) -> Result<TransportDescriptor, MediaError> {
        self.guarded(
            "createTransport",
            Some(cancel),
            self.engine.create_transport(router, options),
        )
        .await
    }

    pub async fn connect_transport(
        &self,
        transport: &TransportId,
        dtls_parameters: &Value,
        cancel: &CancellationToken,
    ) -> Result<(), MediaError> {
        self.guarded(
            "connectTransport",
            Some(cancel),
            self.engine.connect_transport(transport, dtls_parameters),
        )
        .await
    }

    pub async fn produce(
        &self,
        transport: &TransportId,
        kind: MediaKind,
        rtp_parameters: &Value,
        cancel: &CancellationToken,
    ) -> Result<ProducerHandle, MediaError> {
        self.guarded(
            "produce",
            Some(cancel),
            self.engine.produce(transport, kind, rtp_parameters),
        )
        .await
    }

    pub async fn can_consume(
        &self,
        router: &RouterId,
        flow: &FlowId,
        rtp_capabilities: &Value,
        cancel: &CancellationToken,
    ) -> Result<bool, MediaError> {
        self.guarded(
            "canConsume",
            Some(cancel),
            self.engine.can_consume(router, flow, rtp_capabilities),
        )
        .await
    }

    pub async fn consume(
        &self,
        transport: &TransportId,
        flow: &FlowId,
        rtp_capabilities: &Value,
        cancel: &CancellationToken,
    ) -> Result<ConsumerHandle, MediaError> {
        self.guarded(
            "consume",
            Some(cancel),
            self.engine.consume(transport, flow, rtp_capabilities),
        )
        .await
    }

    /// Release a handle. Runs to completion (or timeout) even during teardown.
    pub async fn close(&self, resource: &MediaResource) -> Result<(), MediaError> {
        self.guarded("close", None, self.engine.close(resource)).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::{default_codecs, LoopbackEngine};
    use async_trait::async_trait;

    /// Engine whose every call hangs forever.
    struct StalledEngine;

    #[async_trait]
    impl MediaEngine for StalledEngine {
        async fn create_routing_context(
            &self,
            _codecs: &[CodecCapability],
        ) -> Result<RouterHandle, MediaError> {
            std::future::pending().await
        }
        async fn close_routing_context(&self, _router: &RouterId) -> Result<(), MediaError> {
            std::future::pending().await
        }
        async fn create_transport(
            &self,
            _router: &RouterId,
            _options: &TransportOptions,
        ) -> Result<TransportDescriptor, MediaError> {
            std::future::pending().await
        }
        async fn connect_transport(
            &self,
            _transport: &TransportId,
            _dtls_parameters: &Value,
        ) -> Result<(), MediaError> {
            std::future::pending().await
        }
        async fn produce(
            &self,
            _transport: &TransportId,
            _kind: MediaKind,
            _rtp_parameters: &Value,
        ) -> Result<ProducerHandle, MediaError> {
            std::future::pending().await
        }
        async fn can_consume(
            &self,
            _router: &RouterId,
            _flow: &FlowId,
            _rtp_capabilities: &Value,
        ) -> Result<bool, MediaError> {
            std::future::pending().await
        }
        async fn consume(
            &self,
            _transport: &TransportId,
            _flow: &FlowId,
            _rtp_capabilities: &Value,
        ) -> Result<ConsumerHandle, MediaError> {
            std::future::pending().await
        }
        async fn close(&self, _resource: &MediaResource) -> Result<(), MediaError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let gateway = MediaGateway::new(Arc::new(StalledEngine), Duration::from_secs(2));
        let token = CancellationToken::new();

        let result = gateway
            .connect_transport(&TransportId::from("t-1"), &Value::Null, &token)
            .await;

        assert_eq!(
            result,
            Err(MediaError::Timeout {
                operation: "connectTransport"
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_abandons_call() {
        let gateway = MediaGateway::new(Arc::new(StalledEngine), Duration::from_secs(60));
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let result = gateway
            .produce(
                &TransportId::from("t-1"),
                MediaKind::Audio,
                &Value::Null,
                &token,
            )
            .await;
        assert_eq!(result, Err(MediaError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_ignores_cancellation() {
        let gateway = MediaGateway::new(Arc::new(StalledEngine), Duration::from_secs(1));

        // No token involved: a stalled close ends by timeout, never by cancellation.
        let result = gateway
            .close(&MediaResource::Transport(TransportId::from("t-1")))
            .await;
        assert_eq!(result, Err(MediaError::Timeout { operation: "close" }));
    }

    #[tokio::test]
    async fn test_successful_call_passes_through() {
        let gateway = MediaGateway::new(
            Arc::new(LoopbackEngine::new("127.0.0.1")),
            DEFAULT_MEDIA_CALL_TIMEOUT,
        );
        let router = gateway
            .create_routing_context(&default_codecs())
            .await
            .unwrap();
        assert!(router.rtp_capabilities["codecs"].is_array());
        gateway.close_routing_context(&router.id).await.unwrap();
    }
}
