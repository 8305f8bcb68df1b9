//! Frame decoding and encoding.

use super::messages::{ClientMessage, ServerMessage};
use crate::errors::SfuError;
use serde_json::Value;

/// A frame that could not be turned into a [`ClientMessage`].
#[derive(Debug)]
pub struct DecodeFailure {
    /// The `action` string, when the frame was JSON and carried one.
    pub request: Option<String>,
    pub error: SfuError,
}

impl DecodeFailure {
    fn new(request: Option<String>, detail: impl Into<String>) -> Self {
        Self {
            request,
            error: SfuError::MalformedMessage(detail.into()),
        }
    }

    /// The `error` reply for this frame.
    #[must_use]
    pub fn to_reply(&self) -> ServerMessage {
        ServerMessage::rejection(self.request.as_deref(), &self.error)
    }
}

/// Decode one text frame.
///
/// # Errors
///
/// Returns [`DecodeFailure`] for non-JSON payloads, a missing or unknown
/// `action`, and missing or mistyped fields.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, DecodeFailure> {
    let value: Value = serde_json::from_str(text)
        .map_err(|_| DecodeFailure::new(None, "payload is not valid JSON"))?;

    let request = match value.get("action") {
        Some(Value::String(action)) => action.clone(),
        Some(_) => return Err(DecodeFailure::new(None, "action must be a string")),
        None => return Err(DecodeFailure::new(None, "missing action")),
    };

    if !ClientMessage::ACTIONS.contains(&request.as_str()) {
        let detail = format!("unknown action '{request}'");
        return Err(DecodeFailure::new(Some(request), detail));
    }

    serde_json::from_value(value).map_err(|e| DecodeFailure::new(Some(request), e.to_string()))
}

/// Encode one outbound message as a text frame.
///
/// # Errors
///
/// Returns `SfuError::Internal` if serialization fails.
pub fn encode_server_message(message: &ServerMessage) -> Result<String, SfuError> {
    serde_json::to_string(message)
        .map_err(|e| SfuError::Internal(format!("failed to encode {}: {e}", message.action())))
}
