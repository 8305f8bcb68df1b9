//! Common data types for the SFU coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Maximum accepted length of a room identifier, in bytes.
pub const MAX_ROOM_ID_LEN: usize = 128;

/// Unique identifier for a connected peer.
///
/// Generated by the coordinator when a connection is established; never
/// supplied by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub Uuid);

impl PeerId {
    /// Create a new random peer ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Rejection reasons for a caller-supplied room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomIdError {
    #[error("room id must not be empty")]
    Empty,

    #[error("room id exceeds {MAX_ROOM_ID_LEN} bytes")]
    TooLong,
}

/// Caller-supplied identifier for a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Validate and wrap a room identifier.
    ///
    /// Whitespace-only ids count as empty.
    pub fn parse(raw: &str) -> Result<Self, RoomIdError> {
        if raw.trim().is_empty() {
            return Err(RoomIdError::Empty);
        }
        if raw.len() > MAX_ROOM_ID_LEN {
            return Err(RoomIdError::TooLong);
        }
        Ok(Self(raw.to_string()))
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque string identifiers minted by the media engine.
macro_rules! engine_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

engine_id!(
    /// Identifier of a published media flow (the engine's producer id).
    FlowId
);
engine_id!(
    /// Identifier of a send or receive transport.
    TransportId
);
engine_id!(
    /// Identifier of a consumer (one peer's subscription to one flow).
    ConsumerId
);
engine_id!(
    /// Identifier of a per-room routing context.
    RouterId
);

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_parse() {
        let id = RoomId::parse("r1").unwrap();
        assert_eq!(id.as_str(), "r1");
        assert_eq!(id.to_string(), "r1");

        assert_eq!(RoomId::parse(""), Err(RoomIdError::Empty));
        assert_eq!(RoomId::parse("   "), Err(RoomIdError::Empty));

        let long = "x".repeat(MAX_ROOM_ID_LEN + 1);
        assert_eq!(RoomId::parse(&long), Err(RoomIdError::TooLong));
        assert!(RoomId::parse(&"x".repeat(MAX_ROOM_ID_LEN)).is_ok());
    }

    #[test]
    fn test_peer_ids_are_unique() {
        assert_ne!(PeerId::new(), PeerId::new());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let flow = FlowId::from("flow-1");
        assert_eq!(serde_json::to_string(&flow).unwrap(), "\"flow-1\"");

        let room = RoomId::parse("lobby").unwrap();
        assert_eq!(serde_json::to_string(&room).unwrap(), "\"lobby\"");

        let peer = PeerId::new();
        assert_eq!(
            serde_json::to_string(&peer).unwrap(),
            format!("\"{}\"", peer.0)
        );
    }
}
