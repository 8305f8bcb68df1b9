//! Client-facing signaling transport.
//!
//! One WebSocket per peer session. Frames are JSON text; see
//! [`crate::signaling`] for the message set.

pub mod websocket;

pub use websocket::{signaling_router, SignalingState};
