//! Actor model implementation for the SFU coordinator.
//!
//! ```text
//! RoomRegistryActor (singleton per process)
//! └── supervises N RoomActors
//!     └── RoomActor (one per active room)
//!         ├── owns membership, the flow list and consumption records
//!         └── owns the room's routing context
//!
//! PeerSessionActor (one per signaling connection)
//! ├── owns the peer's transports, producers and consumers
//! └── talks to the registry and to its RoomActor
//! ```
//!
//! # Key Design Decisions
//!
//! - **One room per connection**: a client in two rooms opens two connections
//! - **Registry serializes room creation**: concurrent first joins create one
//!   routing context; the engine call itself runs off the registry loop
//! - **Peer owns its client queue**: rooms send notices to the peer actor,
//!   which forwards them after its own replies and disconnects a client that
//!   stops reading
//! - **Room serializes membership**: a join observes either all or none of a
//!   concurrent leave
//! - **CancellationToken propagation**: rooms and peer sessions hold child
//!   tokens of the registry's root token
//! - **Mailbox monitoring**: depth thresholds with metrics (Room: 100/500, Peer: 50/200)
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor` singleton that supervises rooms
//! - [`room`] - `RoomActor` per active room
//! - [`peer`] - `PeerSessionActor` per connection
//! - [`flows`] - per-room flow list and consumption records
//! - [`outbound`] - per-connection outbound queue
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

mod dispatch;
pub mod flows;
pub mod messages;
pub mod metrics;
pub mod outbound;
pub mod peer;
pub mod registry;
pub mod room;

// Re-export primary types
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use outbound::{OutboundChannel, SendFailure};
pub use peer::{PeerContext, PeerSessionActor, PeerSessionHandle, PeerSettings, SpawnedPeer};
pub use registry::{RegistrySettings, RoomRegistryHandle};
pub use room::{RoomActor, RoomActorHandle};
