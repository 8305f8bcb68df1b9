//! SFU coordinator error types.
//!
//! Error types map to signaling `error` codes sent to the peer that caused them.
//! Internal details are logged server-side but not exposed to clients.

use crate::media::MediaError;
use thiserror::Error;

/// Client-facing error codes carried by the signaling `error` message.
pub mod codes {
    pub const INVALID_REQUEST: i32 = 1;
    pub const PRECONDITION_FAILED: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 5;
    pub const INTERNAL_ERROR: i32 = 6;
    pub const CAPACITY_EXCEEDED: i32 = 7;
    pub const MEDIA_FAILURE: i32 = 8;
}

/// SFU coordinator error type.
///
/// Maps to signaling error codes:
/// - `MalformedMessage`, `InvalidRoomId`: `INVALID_REQUEST` (1)
/// - `NotJoined`, `AlreadyJoined`, `TransportMissing`: `PRECONDITION_FAILED` (3)
/// - `UnknownTransport`, `FlowNotFound`, `RoomNotFound`: `NOT_FOUND` (4)
/// - `Conflict`: `CONFLICT` (5)
/// - `Internal`, `RoomClosed`, `Cancelled`: `INTERNAL_ERROR` (6)
/// - `RoomCapacityExceeded`, `ServerCapacityExceeded`, `ShuttingDown`: `CAPACITY_EXCEEDED` (7)
/// - `Media`: `MEDIA_FAILURE` (8), or `CAPACITY_EXCEEDED` (7) when the engine is exhausted
#[derive(Debug, Error)]
pub enum SfuError {
    /// Undecodable payload, unknown action, or missing required field.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The supplied room id is empty or too long.
    #[error("Invalid room id: {0}")]
    InvalidRoomId(String),

    /// Action requires a joined room.
    #[error("Peer has not joined a room")]
    NotJoined,

    /// `joinRoom` sent by a peer that already has a room.
    #[error("Peer already joined room {0}")]
    AlreadyJoined(String),

    /// Action requires a transport the peer has not created.
    #[error("No {0} transport established")]
    TransportMissing(&'static str),

    /// Transport id does not belong to the peer.
    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    /// Flow is not (or no longer) published in the room.
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Room is not present in the registry.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Request conflicts with existing state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Room holds the maximum number of peers.
    #[error("Room at capacity: {0}")]
    RoomCapacityExceeded(String),

    /// Process holds the maximum number of rooms.
    #[error("Server at capacity")]
    ServerCapacityExceeded,

    /// Registry is shutting down and rejects new rooms.
    #[error("Server is shutting down")]
    ShuttingDown,

    /// Room actor stopped before answering.
    #[error("Room closed: {0}")]
    RoomClosed(String),

    /// Media-engine call failed, timed out, or was rejected.
    #[error("Media engine error during {operation}: {source}")]
    Media {
        operation: &'static str,
        #[source]
        source: MediaError,
    },

    /// The peer's connection closed while the request was in flight.
    #[error("Request cancelled")]
    Cancelled,

    /// Internal error (channel failures, actor crashes).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Wrap a media-engine failure with the operation that produced it.
    #[must_use]
    pub fn media(operation: &'static str, source: MediaError) -> Self {
        match source {
            MediaError::Cancelled => SfuError::Cancelled,
            source => SfuError::Media { operation, source },
        }
    }

    /// Returns the signaling error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            SfuError::MalformedMessage(_) | SfuError::InvalidRoomId(_) => codes::INVALID_REQUEST,
            SfuError::NotJoined | SfuError::AlreadyJoined(_) | SfuError::TransportMissing(_) => {
                codes::PRECONDITION_FAILED
            }
            SfuError::UnknownTransport(_)
            | SfuError::FlowNotFound(_)
            | SfuError::RoomNotFound(_) => codes::NOT_FOUND,
            SfuError::Conflict(_) => codes::CONFLICT,
            SfuError::RoomCapacityExceeded(_)
            | SfuError::ServerCapacityExceeded
            | SfuError::ShuttingDown => codes::CAPACITY_EXCEEDED,
            SfuError::Media { source, .. } if source.is_exhaustion() => codes::CAPACITY_EXCEEDED,
            SfuError::Media { .. } => codes::MEDIA_FAILURE,
            SfuError::RoomClosed(_) | SfuError::Cancelled | SfuError::Internal(_) => {
                codes::INTERNAL_ERROR
            }
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SfuError::Internal(_) | SfuError::RoomClosed(_) | SfuError::Cancelled => {
                "An internal error occurred".to_string()
            }
            SfuError::MalformedMessage(detail) => format!("Malformed message: {detail}"),
            SfuError::InvalidRoomId(reason) => format!("Invalid room id: {reason}"),
            SfuError::NotJoined => "Join a room first".to_string(),
            SfuError::AlreadyJoined(_) => "Already joined a room".to_string(),
            SfuError::TransportMissing(direction) => {
                format!("Create a {direction} transport first")
            }
            SfuError::UnknownTransport(_) => "Unknown transport".to_string(),
            SfuError::FlowNotFound(_) => "Flow not found".to_string(),
            SfuError::RoomNotFound(_) => "Room not found".to_string(),
            SfuError::Conflict(msg) => msg.clone(),
            SfuError::RoomCapacityExceeded(_) => "Room is at capacity".to_string(),
            SfuError::ServerCapacityExceeded => {
                "Server is at capacity, please try again".to_string()
            }
            SfuError::ShuttingDown => "Server is shutting down, please reconnect".to_string(),
            SfuError::Media { operation, source } if source.is_exhaustion() => {
                format!("Media server out of resources during {operation}")
            }
            SfuError::Media { operation, source } => match source {
                MediaError::Timeout { .. } => format!("Media server timed out during {operation}"),
                _ => format!("Media server rejected {operation}"),
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            SfuError::MalformedMessage("bad json".to_string()).error_code(),
            1
        );
        assert_eq!(SfuError::InvalidRoomId("empty".to_string()).error_code(), 1);

        assert_eq!(SfuError::NotJoined.error_code(), 3);
        assert_eq!(SfuError::AlreadyJoined("r1".to_string()).error_code(), 3);
        assert_eq!(SfuError::TransportMissing("send").error_code(), 3);

        assert_eq!(SfuError::UnknownTransport("t-1".to_string()).error_code(), 4);
        assert_eq!(SfuError::FlowNotFound("f-1".to_string()).error_code(), 4);
        assert_eq!(SfuError::RoomNotFound("r1".to_string()).error_code(), 4);

        assert_eq!(SfuError::Conflict("dup".to_string()).error_code(), 5);

        assert_eq!(SfuError::Internal("boom".to_string()).error_code(), 6);
        assert_eq!(SfuError::Cancelled.error_code(), 6);
        assert_eq!(SfuError::RoomClosed("r1".to_string()).error_code(), 6);

        assert_eq!(SfuError::ServerCapacityExceeded.error_code(), 7);
        assert_eq!(
            SfuError::RoomCapacityExceeded("r1".to_string()).error_code(),
            7
        );
        assert_eq!(SfuError::ShuttingDown.error_code(), 7);

        assert_eq!(
            SfuError::media("produce", MediaError::Rejected("bad rtp".to_string())).error_code(),
            8
        );
        assert_eq!(
            SfuError::media("consume", MediaError::Timeout { operation: "consume" }).error_code(),
            8
        );
        assert_eq!(
            SfuError::media("createTransport", MediaError::Exhausted("ports".to_string()))
                .error_code(),
            7
        );
    }

    #[test]
    fn test_media_cancellation_maps_to_cancelled() {
        let err = SfuError::media("produce", MediaError::Cancelled);
        assert!(matches!(err, SfuError::Cancelled));
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let err = SfuError::Internal("channel closed at room actor 0xdeadbeef".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");
        assert!(!err.client_message().contains("0xdeadbeef"));

        let err = SfuError::media(
            "produce",
            MediaError::Rejected("worker 3 pid 4411 crashed".to_string()),
        );
        assert!(!err.client_message().contains("4411"));
        assert_eq!(err.client_message(), "Media server rejected produce");
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", SfuError::UnknownTransport("t-9".to_string())),
            "Unknown transport: t-9"
        );
        assert_eq!(
            format!("{}", SfuError::TransportMissing("recv")),
            "No recv transport established"
        );
        assert_eq!(
            format!(
                "{}",
                SfuError::media("connectTransport", MediaError::Timeout { operation: "connectTransport" })
            ),
            "Media engine error during connectTransport: Media engine call timed out: connectTransport"
        );
    }
}
