//! Actor metrics and mailbox monitoring.
//!
//! | Actor Type | Normal | Elevated | Critical |
//! |------------|--------|----------|----------|
//! | Registry   | <= 100 | 101-500  | > 500    |
//! | Room       | <= 100 | 101-500  | > 500    |
//! | Peer       | <= 50  | 51-200   | > 200    |
//!
//! Peer mailboxes hold one connection's requests, so they alarm earlier than
//! the shared registry and room mailboxes.

use crate::observability::metrics as prom;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Depths at which a mailbox is considered elevated or critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxThresholds {
    /// Depths above this are elevated.
    pub elevated: usize,
    /// Depths above this are critical.
    pub critical: usize,
}

impl MailboxThresholds {
    #[must_use]
    pub const fn level(&self, depth: usize) -> MailboxLevel {
        if depth > self.critical {
            MailboxLevel::Critical
        } else if depth > self.elevated {
            MailboxLevel::Elevated
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `RoomRegistryActor` (singleton).
    Registry,
    /// `RoomActor` (one per room).
    Room,
    /// `PeerSessionActor` (one per signaling connection).
    Peer,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Room => "room",
            ActorType::Peer => "peer",
        }
    }

    #[must_use]
    pub const fn thresholds(&self) -> MailboxThresholds {
        match self {
            ActorType::Registry | ActorType::Room => MailboxThresholds {
                elevated: 100,
                critical: 500,
            },
            ActorType::Peer => MailboxThresholds {
                elevated: 50,
                critical: 200,
            },
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MailboxLevel {
    Normal,
    Elevated,
    Critical,
}

/// Tracks queue depth of one actor's mailbox, plus messages it had to drop.
///
/// Handles count a message when they send it and the actor counts it again
/// once handled, so the depth includes messages still waiting in the channel.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Room id, peer id or registry instance id.
    actor_id: String,
    thresholds: MailboxThresholds,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    processed: AtomicU64,
    dropped: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            thresholds: actor_type.thresholds(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Count a message sent to the actor. Logs when the depth moves into a
    /// higher level.
    pub fn record_enqueue(&self) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), depth);

        let level = self.thresholds.level(depth);
        if level == self.thresholds.level(depth - 1) {
            return;
        }
        match level {
            MailboxLevel::Critical => warn!(
                target: "sfu.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                critical = self.thresholds.critical,
                "Mailbox depth critical"
            ),
            MailboxLevel::Elevated => debug!(
                target: "sfu.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                "Mailbox depth elevated"
            ),
            MailboxLevel::Normal => {}
        }
    }

    /// Count a message the actor finished handling.
    pub fn record_dequeue(&self) {
        let depth = saturating_decrement(&self.depth);
        self.processed.fetch_add(1, Ordering::Relaxed);
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), depth);
    }

    /// Undo `record_enqueue` for a message the closed mailbox refused.
    pub fn cancel_enqueue(&self) {
        let depth = saturating_decrement(&self.depth);
        prom::set_actor_mailbox_depth(self.actor_type.as_str(), depth);
    }

    /// Count a notice that never reached the client because its outbound
    /// queue stayed full.
    pub fn record_drop(&self) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_message_dropped(self.actor_type.as_str());
        warn!(
            target: "sfu.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            dropped,
            "Outbound queue stalled, notice dropped"
        );
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.thresholds.level(self.current_depth())
    }
}

/// Decrement without wrapping; returns the new value.
fn saturating_decrement(value: &AtomicUsize) -> usize {
    let previous = value
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        })
        .unwrap_or(0);
    previous.saturating_sub(1)
}

/// Process-wide actor counters, shared by every actor.
///
/// Room and connection counts are mirrored into the Prometheus gauges.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    rooms: AtomicUsize,
    connections: AtomicUsize,
    panics: AtomicU64,
    messages_processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let rooms = self.rooms.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_rooms_active(rooms);
    }

    pub fn room_removed(&self) {
        prom::set_rooms_active(saturating_decrement(&self.rooms));
    }

    pub fn connection_created(&self) {
        let connections = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_connections_active(connections as u64);
    }

    pub fn connection_closed(&self) {
        prom::set_connections_active(saturating_decrement(&self.connections) as u64);
    }

    /// An actor task ended in a panic. Always a bug.
    pub fn record_panic(&self, actor_type: ActorType) {
        let panics = self.panics.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_actor_panic(actor_type.as_str());
        error!(
            target: "sfu.actor.panic",
            actor_type = actor_type.as_str(),
            panics,
            "Actor task panicked"
        );
    }

    pub fn record_message_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }
}
