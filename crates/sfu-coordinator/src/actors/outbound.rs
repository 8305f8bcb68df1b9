//! Per-connection outbound queue.
//!
//! The transport writer task drains the receiving end; only the peer actor
//! writes to it, so replies and room notices reach the client in the order
//! the actor handled them.

use crate::signaling::ServerMessage;
use common::types::PeerId;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Why a message did not make it into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The writer side is gone.
    Closed,
    /// The queue stayed full for the whole allowance.
    Stalled,
}

/// Sending side of one peer's outbound queue.
#[derive(Debug, Clone)]
pub struct OutboundChannel {
    peer_id: PeerId,
    sender: mpsc::Sender<ServerMessage>,
}

impl OutboundChannel {
    /// Create a queue with `capacity` slots.
    #[must_use]
    pub fn channel(peer_id: PeerId, capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { peer_id, sender }, receiver)
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Queue a message, waiting for space. Returns `false` if the connection is gone.
    pub async fn send(&self, message: ServerMessage) -> bool {
        self.sender.send(message).await.is_ok()
    }

    /// Queue a message, waiting at most `allowance` for space.
    pub async fn send_within(
        &self,
        message: ServerMessage,
        allowance: Duration,
    ) -> Result<(), SendFailure> {
        match self.sender.send_timeout(message, allowance).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(SendFailure::Stalled),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(SendFailure::Closed),
        }
    }

    /// Queue a message only if there is room right now.
    pub fn try_send(&self, message: ServerMessage) -> Result<(), SendFailure> {
        self.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => SendFailure::Stalled,
            TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Whether the writer side has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn notice() -> ServerMessage {
        ServerMessage::PeerDisconnected {
            peer_id: PeerId::new(),
        }
    }

    #[tokio::test]
    async fn test_send_within_waits_for_the_reader() {
        let (outbound, mut rx) = OutboundChannel::channel(PeerId::new(), 1);
        assert!(outbound.send(notice()).await);

        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let first = rx.recv().await;
            let second = rx.recv().await;
            (first.is_some(), second.is_some())
        });

        assert_eq!(
            outbound.send_within(notice(), Duration::from_secs(2)).await,
            Ok(())
        );
        assert_eq!(reader.await.unwrap(), (true, true));
    }

    #[tokio::test]
    async fn test_send_within_reports_a_stalled_reader() {
        let (outbound, _rx) = OutboundChannel::channel(PeerId::new(), 1);
        assert!(outbound.try_send(notice()).is_ok());

        assert_eq!(outbound.try_send(notice()), Err(SendFailure::Stalled));
        assert_eq!(
            outbound
                .send_within(notice(), Duration::from_millis(20))
                .await,
            Err(SendFailure::Stalled)
        );
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let (outbound, rx) = OutboundChannel::channel(PeerId::new(), 4);
        drop(rx);

        assert!(outbound.is_closed());
        assert!(!outbound.send(notice()).await);
        assert_eq!(outbound.try_send(notice()), Err(SendFailure::Closed));
        assert_eq!(
            outbound
                .send_within(notice(), Duration::from_millis(20))
                .await,
            Err(SendFailure::Closed)
        );
    }
}
