//! Signaling protocol: message types and the JSON frame codec.

pub mod codec;
pub mod messages;

pub use codec::{decode_client_message, encode_server_message, DecodeFailure};
pub use messages::{ClientMessage, ConsumerParams, FlowInfo, ServerMessage, TransportParams};
