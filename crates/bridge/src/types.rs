//! Wire value types for the bridge protocol.
//!
//! A [`Message`] asks the remote side to run a named handler; a [`Response`]
//! carries the outcome of a message that expected a callback. Both are plain
//! JSON-compatible structures and are encoded by a [`crate::codec::Codec`]
//! before crossing the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{BridgeError, MessageId};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A request or notification addressed to a named handler on the remote side.
///
/// `id` is absent for notifications that nobody correlates; it is assigned by
/// the transport adapter whenever a reply or an acknowledgement has to be
/// matched back to this message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Correlation identifier assigned by the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,

    /// Name of the remote handler to invoke.
    pub name: String,

    /// Positional JSON-compatible arguments for the handler.
    #[serde(default)]
    pub parameters: Vec<Value>,

    /// Whether the sender waits for a [`Response`].
    #[serde(default)]
    pub expects_callback: bool,
}

impl Message {
    /// A fire-and-forget message.
    pub fn notification(name: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self {
            id: None,
            name: name.into(),
            parameters,
            expects_callback: false,
        }
    }

    /// A message whose sender waits for a [`Response`].
    pub fn request(name: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self {
            id: None,
            name: name.into(),
            parameters,
            expects_callback: true,
        }
    }

    /// Validates the shape of a decoded payload and converts it into a message.
    ///
    /// Accepts an integer-or-absent `id`, a string `name`, an array-or-absent
    /// `parameters`, and a boolean-or-absent `expectsCallback`.
    pub fn from_value(value: Value) -> Result<Self, BridgeError> {
        serde_json::from_value(value).map_err(|e| BridgeError::MalformedPayload {
            message: format!("invalid message: {e}"),
        })
    }

    /// Converts the message into its JSON representation.
    pub fn to_value(&self) -> Value {
        serde_json::json!(self)
    }

    /// Extracts the correlation id of a payload that failed validation, if it
    /// still identifies a sender waiting for a response.
    pub fn waiting_id(value: &Value) -> Option<MessageId> {
        let object = value.as_object()?;
        if object.get("expectsCallback").and_then(Value::as_bool) != Some(true) {
            return None;
        }
        object.get("id").and_then(Value::as_u64).map(MessageId::new)
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// The outcome of a request, routed back to the sender's pending handler.
///
/// By convention the first parameter is the result (on success) or the error
/// payload (on failure); further parameters are allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// `true` resolves the waiting promise, `false` rejects it.
    pub success: bool,

    /// Result values or rejection reasons.
    #[serde(default)]
    pub parameters: Vec<Value>,
}

impl Response {
    /// A successful response carrying `values`.
    pub fn success(values: Vec<Value>) -> Self {
        Self {
            success: true,
            parameters: values,
        }
    }

    /// A failed response carrying `reasons`.
    pub fn failure(reasons: Vec<Value>) -> Self {
        Self {
            success: false,
            parameters: reasons,
        }
    }

    /// Validates the shape of a decoded response.
    pub fn from_value(value: Value) -> Result<Self, BridgeError> {
        serde_json::from_value(value).map_err(|e| BridgeError::MalformedPayload {
            message: format!("invalid response: {e}"),
        })
    }

    /// Converts the response into its JSON representation.
    pub fn to_value(&self) -> Value {
        serde_json::json!(self)
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// protocol API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
