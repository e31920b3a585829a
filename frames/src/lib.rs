//! Shared frame model and JSON codec for the canvas WS transport.
//!
//! Every message on the wire is a JSON object `{type, payload}`. The `type`
//! doubles as the dispatch key on the client event bus, so application
//! channels (`canvas:{id}`, `canvas:{id}:history`) and reserved control
//! types (`ping`, `pong`, `authenticate`) share one namespace.
//!
//! Payloads stay flexible (`serde_json::Value`); the typed payload structs
//! below cover the shapes the sync layer produces and consumes.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Keepalive request sent by the client.
pub const PING: &str = "ping";
/// Keepalive acknowledgement sent by the server. Never dispatched.
pub const PONG: &str = "pong";
/// First frame on an authenticated connection.
pub const AUTHENTICATE: &str = "authenticate";
/// Same-process broadcast used by canvas-level updates.
pub const CANVAS_UPDATE: &str = "canvas:update";

/// Error returned by [`decode_frame`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The text was not valid JSON.
    #[error("failed to decode JSON frame: {0}")]
    Decode(#[from] serde_json::Error),
    /// The JSON parsed but has no string `type` field.
    #[error("frame is missing a string `type`")]
    MissingType,
}

/// A single message on the realtime wire protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Channel or control type, e.g. `"canvas:42"` or `"ping"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Arbitrary JSON payload. Omitted on the wire when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Frame {
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self { kind: kind.into(), payload: Some(payload) }
    }

    /// A keepalive request with no payload.
    #[must_use]
    pub fn ping() -> Self {
        Self { kind: PING.to_owned(), payload: None }
    }

    /// The authentication frame carrying `token`.
    #[must_use]
    pub fn authenticate(token: &str) -> Self {
        let payload = Authenticate { token: token.to_owned() };
        // A single string field always serializes.
        Self::new(AUTHENTICATE, serde_json::to_value(payload).unwrap_or_default())
    }

    /// Whether this frame is a keepalive acknowledgement.
    #[must_use]
    pub fn is_pong(&self) -> bool {
        self.kind == PONG
    }

    /// Payload or JSON null when absent.
    #[must_use]
    pub fn payload_or_null(&self) -> Value {
        self.payload.clone().unwrap_or(Value::Null)
    }
}

/// Encode a frame into its JSON text form.
#[must_use]
pub fn encode_frame(frame: &Frame) -> String {
    // Serializing a String key and a serde_json::Value cannot fail.
    serde_json::to_string(frame).unwrap_or_default()
}

/// Decode JSON text into a frame.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed JSON and
/// [`CodecError::MissingType`] when `type` is absent or not a string.
pub fn decode_frame(text: &str) -> Result<Frame, CodecError> {
    let value = serde_json::from_str::<Value>(text)?;
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Err(CodecError::MissingType);
    };
    Ok(Frame { kind: kind.to_owned(), payload: value.get("payload").cloned() })
}

// =============================================================================
// CHANNELS
// =============================================================================

/// Edit channel for one idea's sections.
#[must_use]
pub fn canvas_channel(idea_id: &str) -> String {
    format!("canvas:{idea_id}")
}

/// History-notification channel for one idea.
#[must_use]
pub fn history_channel(idea_id: &str) -> String {
    format!("canvas:{idea_id}:history")
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Payload of the `authenticate` frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authenticate {
    pub token: String,
}

/// Broadcast on the edit channel whenever a section's text changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionUpdate {
    #[serde(deserialize_with = "string_or_number")]
    pub section_id: String,
    pub new_text: String,
}

/// Broadcast on the history channel after an autosave lands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryUpdate {
    /// The created history entry as returned by the REST API.
    pub entry: Value,
}

/// Ids arrive as strings or integers depending on the backing store.
///
/// # Errors
///
/// Fails for any JSON value other than a string or a number.
pub fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string or number id, got {other}"))),
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
