//! Top-level error types and the cross-boundary error envelope.
//!
//! [`BridgeError`] covers conditions raised to a local caller or logged by the
//! dispatcher. Component-level errors (codec failures, promise double-settlement)
//! are defined in their respective modules and wrapped here.
//!
//! [`ErrorEnvelope`] is the portable `{type, message, backtrace}` form of an
//! error. It is the only error shape that crosses the boundary: a handler fault
//! on one side becomes an envelope in the rejected promise on the other.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::codec::CodecError;
use crate::promise::PromiseError;

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

/// Coarse classification of an [`ErrorEnvelope`] by its type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Lookup of an undefined name (handler, function, variable).
    Reference,
    /// Unparseable input or malformed payload.
    Syntax,
    /// A value of the wrong type or an invalid argument.
    Type,
    /// Anything else.
    Generic,
}

impl ErrorKind {
    /// Classifies an error type name.
    pub fn classify(type_name: &str) -> Self {
        const REFERENCE: &[&str] = &["ReferenceError", "NameError", "NoMethodError", "NoSuchHandler"];
        const SYNTAX: &[&str] = &["SyntaxError", "Parse", "MalformedPayload", "CodecError"];
        const TYPE: &[&str] = &["TypeError", "ArgumentError", "InvalidArgument"];

        let matches = |names: &[&str]| names.iter().any(|n| type_name.contains(n));
        if matches(REFERENCE) {
            Self::Reference
        } else if matches(SYNTAX) {
            Self::Syntax
        } else if matches(TYPE) {
            Self::Type
        } else {
            Self::Generic
        }
    }
}

/// Portable representation of a native error.
///
/// Decoding also accepts the `{name, message, stack}` shape produced by
/// script-side error objects.
///
/// Does not implement [`std::error::Error`]: the blanket `From<E: Error>`
/// conversion below requires it, and lets handlers use `?` on any error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Error class or kind name (e.g. `"ZeroDivisionError"`).
    #[serde(rename = "type", alias = "name")]
    pub error_type: String,

    /// Human-readable description.
    #[serde(default)]
    pub message: String,

    /// Best-effort trace, outermost frame first.
    #[serde(default, alias = "stack", deserialize_with = "deserialize_backtrace")]
    pub backtrace: Vec<String>,
}

impl ErrorEnvelope {
    /// Creates an envelope with an empty backtrace.
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }

    /// Replaces the backtrace.
    pub fn with_backtrace(mut self, backtrace: Vec<String>) -> Self {
        self.backtrace = backtrace;
        self
    }

    /// Classifies the envelope's type name.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::classify(&self.error_type)
    }

    /// Converts the envelope into its JSON representation.
    pub fn to_value(&self) -> Value {
        serde_json::json!(self)
    }

    /// Reads an envelope back from a rejection reason, if it has that shape.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

impl std::fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl<E> From<E> for ErrorEnvelope
where
    E: std::error::Error + 'static,
{
    #[track_caller]
    fn from(error: E) -> Self {
        let location = std::panic::Location::caller();
        let mut backtrace = vec![format!("{}:{}:{}", location.file(), location.line(), location.column())];
        let mut source = error.source();
        while let Some(cause) = source {
            backtrace.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            error_type: short_type_name::<E>().to_string(),
            message: error.to_string(),
            backtrace,
        }
    }
}

/// `std::any::type_name` without the module path or generic arguments.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

fn deserialize_backtrace<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    // Script stacks arrive as one newline-separated string.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Trace {
        Lines(Vec<String>),
        Text(String),
        Missing(()),
    }

    Ok(match Trace::deserialize(deserializer)? {
        Trace::Lines(lines) => lines,
        Trace::Text(text) => text.lines().map(str::to_string).collect(),
        Trace::Missing(()) => Vec::new(),
    })
}

// ---------------------------------------------------------------------------
// Bridge errors
// ---------------------------------------------------------------------------

/// Errors raised by the bridge to a local caller or reported by the dispatcher.
///
/// Invalid-argument and promise errors are local programming errors and never
/// cross the boundary. Handler faults and missing handlers are turned into an
/// [`ErrorEnvelope`] for the remote side and also logged locally.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A malformed call to `on`/`once`/`off`/`call`/`get`/`invoke`.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the offending argument.
        message: String,
    },

    /// An inbound message or response failed shape validation.
    #[error("Malformed payload: {message}")]
    MalformedPayload {
        /// Description of the malformed input.
        message: String,
    },

    /// An inbound message named a handler that is not registered.
    #[error("No registered callback `{name}` found")]
    NoSuchHandler {
        /// The requested handler name.
        name: String,
    },

    /// A registered handler failed while running on behalf of a message.
    #[error("Error when executing handler `{name}`: {envelope}")]
    HandlerFault {
        /// The handler that failed.
        name: String,
        /// The fault as reported to the remote side.
        envelope: ErrorEnvelope,
    },

    /// The remote side rejected a request with an error envelope.
    #[error("Remote error {0}")]
    Remote(ErrorEnvelope),

    /// A promise was rejected with reasons that are not an error envelope.
    #[error("Rejected with {reasons:?}")]
    Rejected {
        /// The raw rejection reasons.
        reasons: Vec<Value>,
    },

    /// The configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// Encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A promise was settled twice.
    #[error(transparent)]
    Promise(#[from] PromiseError),
}

impl BridgeError {
    /// Shorthand for [`BridgeError::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Reconstructs an error from the reasons of a rejected promise.
    pub fn from_reasons(reasons: Vec<Value>) -> Self {
        match reasons.first().and_then(ErrorEnvelope::from_value) {
            Some(envelope) => Self::Remote(envelope),
            None => Self::Rejected { reasons },
        }
    }

    /// The portable form of this error, as sent to the remote side.
    pub fn to_envelope(&self) -> ErrorEnvelope {
        let error_type = match self {
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::MalformedPayload { .. } => "MalformedPayload",
            Self::NoSuchHandler { .. } => "NoSuchHandler",
            Self::HandlerFault { envelope, .. } | Self::Remote(envelope) => {
                return envelope.clone();
            }
            Self::Rejected { .. } => "Rejected",
            Self::Configuration { .. } => "ConfigurationError",
            Self::Codec(_) => "CodecError",
            Self::Promise(_) => "PromiseError",
        };
        ErrorEnvelope::new(error_type, self.to_string())
    }
}
