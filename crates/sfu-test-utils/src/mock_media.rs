//! Mock media engine for coordinator tests.
//!
//! Wraps [`LoopbackEngine`] so successful calls behave like a real engine
//! (handles, cascading closes), and lets a test:
//! - Fail selected operations, once or always
//! - Hang selected operations to exercise timeouts and cancellation
//! - Delay every call of an operation
//! - Count calls per operation
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::{Fault, MediaOp, MockMediaEngine};
//!
//! let engine = MockMediaEngine::builder()
//!     .fail(MediaOp::CreateRoutingContext, Fault::Exhausted)
//!     .build();
//! ```

use async_trait::async_trait;
use common::types::{FlowId, RouterId, TransportId};
use serde_json::Value;
use sfu_coordinator::media::{
    CodecCapability, ConsumerHandle, LoopbackCounts, LoopbackEngine, MediaEngine, MediaError,
    MediaKind, MediaResource, ProducerHandle, RouterHandle, TransportDescriptor, TransportOptions,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One [`MediaEngine`] operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaOp {
    CreateRoutingContext,
    CloseRoutingContext,
    CreateTransport,
    ConnectTransport,
    Produce,
    CanConsume,
    Consume,
    Close,
}

/// Injected failure.
#[derive(Debug, Clone)]
pub enum Fault {
    /// `MediaError::Rejected` with this reason.
    Reject(String),
    /// `MediaError::Exhausted`.
    Exhausted,
    /// Never completes.
    Hang,
    /// `can_consume` answers `false` (other operations reject).
    Incompatible,
}

#[derive(Debug, Default)]
struct Script {
    always: HashMap<MediaOp, Fault>,
    once: HashMap<MediaOp, VecDeque<Fault>>,
    delays: HashMap<MediaOp, Duration>,
    calls: HashMap<MediaOp, usize>,
}

/// Media engine with scripted faults.
#[derive(Debug)]
pub struct MockMediaEngine {
    inner: LoopbackEngine,
    script: Mutex<Script>,
}

/// Builder for [`MockMediaEngine`].
#[derive(Debug, Default)]
pub struct MockMediaEngineBuilder {
    script: Script,
}

impl MockMediaEngineBuilder {
    /// Fail every call of `op`.
    #[must_use]
    pub fn fail(mut self, op: MediaOp, fault: Fault) -> Self {
        self.script.always.insert(op, fault);
        self
    }

    /// Fail the next call of `op` only. Repeated calls queue further faults.
    #[must_use]
    pub fn fail_once(mut self, op: MediaOp, fault: Fault) -> Self {
        self.script.once.entry(op).or_default().push_back(fault);
        self
    }

    /// Delay every call of `op`.
    #[must_use]
    pub fn delay(mut self, op: MediaOp, delay: Duration) -> Self {
        self.script.delays.insert(op, delay);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<MockMediaEngine> {
        Arc::new(MockMediaEngine {
            inner: LoopbackEngine::new("127.0.0.1"),
            script: Mutex::new(self.script),
        })
    }
}

impl MockMediaEngine {
    #[must_use]
    pub fn builder() -> MockMediaEngineBuilder {
        MockMediaEngineBuilder::default()
    }

    /// Engine without faults.
    #[must_use]
    pub fn healthy() -> Arc<Self> {
        Self::builder().build()
    }

    /// Queue a one-shot fault at runtime.
    pub fn fail_next(&self, op: MediaOp, fault: Fault) {
        self.script
            .lock()
            .unwrap()
            .once
            .entry(op)
            .or_default()
            .push_back(fault);
    }

    /// Remove every scripted fault and delay.
    pub fn heal(&self) {
        let mut script = self.script.lock().unwrap();
        script.always.clear();
        script.once.clear();
        script.delays.clear();
    }

    /// Calls made to `op` so far, including failed ones.
    #[must_use]
    pub fn calls(&self, op: MediaOp) -> usize {
        self.script
            .lock()
            .unwrap()
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Handles currently open in the underlying engine.
    pub async fn open_handles(&self) -> LoopbackCounts {
        self.inner.open_handles().await
    }

    /// Record the call, apply any delay, and return the fault to inject.
    async fn enter(&self, op: MediaOp) -> Option<Fault> {
        let (delay, fault) = {
            let mut script = self.script.lock().unwrap();
            *script.calls.entry(op).or_default() += 1;
            let once = script.once.get_mut(&op).and_then(VecDeque::pop_front);
            let fault = once.or_else(|| script.always.get(&op).cloned());
            (script.delays.get(&op).copied(), fault)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(Fault::Hang) = fault {
            std::future::pending::<()>().await;
        }
        fault
    }

    fn to_error(fault: Fault) -> MediaError {
        match fault {
            Fault::Reject(reason) => MediaError::Rejected(reason),
            Fault::Exhausted => MediaError::Exhausted("scripted exhaustion".to_string()),
            Fault::Incompatible => MediaError::Rejected("incompatible".to_string()),
            Fault::Hang => MediaError::Rejected("unreachable".to_string()),
        }
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_routing_context(
        &self,
        codecs: &[CodecCapability],
    ) -> Result<RouterHandle, MediaError> {
        if let Some(fault) = self.enter(MediaOp::CreateRoutingContext).await {
            return Err(Self::to_error(fault));
        }
        self.inner.create_routing_context(codecs).await
    }

    async fn close_routing_context(&self, router: &RouterId) -> Result<(), MediaError> {
        if let Some(fault) = self.enter(MediaOp::CloseRoutingContext).await {
            return Err(Self::to_error(fault));
        }
        self.inner.close_routing_context(router).await
    }

    async fn create_transport(
        &self,
        router: &RouterId,
        options: &TransportOptions,
    ) -> Result<TransportDescriptor, MediaError> {
        if let Some(fault) = self.enter(MediaOp::CreateTransport).await {
            return Err(Self::to_error(fault));
        }
        self.inner.create_transport(router, options).await
    }

    async fn connect_transport(
        &self,
        transport: &TransportId,
        dtls_parameters: &Value,
    ) -> Result<(), MediaError> {
        if let Some(fault) = self.enter(MediaOp::ConnectTransport).await {
            return Err(Self::to_error(fault));
        }
        self.inner.connect_transport(transport, dtls_parameters).await
    }

    async fn produce(
        &self,
        transport: &TransportId,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerHandle, MediaError> {
        if let Some(fault) = self.enter(MediaOp::Produce).await {
            return Err(Self::to_error(fault));
        }
        self.inner.produce(transport, kind, rtp_parameters).await
    }

    async fn can_consume(
        &self,
        router: &RouterId,
        flow: &FlowId,
        rtp_capabilities: &Value,
    ) -> Result<bool, MediaError> {
        match self.enter(MediaOp::CanConsume).await {
            Some(Fault::Incompatible) => Ok(false),
            Some(fault) => Err(Self::to_error(fault)),
            None => self.inner.can_consume(router, flow, rtp_capabilities).await,
        }
    }

    async fn consume(
        &self,
        transport: &TransportId,
        flow: &FlowId,
        rtp_capabilities: &Value,
    ) -> Result<ConsumerHandle, MediaError> {
        if let Some(fault) = self.enter(MediaOp::Consume).await {
            return Err(Self::to_error(fault));
        }
        self.inner.consume(transport, flow, rtp_capabilities).await
    }

    async fn close(&self, resource: &MediaResource) -> Result<(), MediaError> {
        if let Some(fault) = self.enter(MediaOp::Close).await {
            return Err(Self::to_error(fault));
        }
        self.inner.close(resource).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfu_coordinator::media::default_codecs;

    #[tokio::test]
    async fn test_fail_once_then_recover() {
        let engine = MockMediaEngine::builder()
            .fail_once(MediaOp::CreateRoutingContext, Fault::Exhausted)
            .build();

        let first = engine.create_routing_context(&default_codecs()).await;
        assert!(matches!(first, Err(MediaError::Exhausted(_))));

        let second = engine.create_routing_context(&default_codecs()).await;
        assert!(second.is_ok());
        assert_eq!(engine.calls(MediaOp::CreateRoutingContext), 2);
        assert_eq!(engine.open_handles().await.routers, 1);
    }

    #[tokio::test]
    async fn test_incompatible_can_consume() {
        let engine = MockMediaEngine::builder()
            .fail(MediaOp::CanConsume, Fault::Incompatible)
            .build();
        let router = engine
            .create_routing_context(&default_codecs())
            .await
            .unwrap();

        let result = engine
            .can_consume(&router.id, &FlowId::from("any"), &Value::Null)
            .await;
        assert_eq!(result, Ok(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_never_completes() {
        let engine = MockMediaEngine::builder()
            .fail(MediaOp::Close, Fault::Hang)
            .build();
        let resource = MediaResource::Consumer("consumer-x".into());

        let result =
            tokio::time::timeout(Duration::from_secs(60), engine.close(&resource)).await;
        assert!(result.is_err(), "hung call must not complete");
    }

    #[tokio::test]
    async fn test_heal_clears_faults() {
        let engine = MockMediaEngine::builder()
            .fail(MediaOp::CreateRoutingContext, Fault::Reject("down".into()))
            .build();
        assert!(engine.create_routing_context(&default_codecs()).await.is_err());

        engine.heal();
        assert!(engine.create_routing_context(&default_codecs()).await.is_ok());
    }
}
