//! Serialization of JSON-compatible values for the wire.
//!
//! Everything that crosses the boundary is a [`serde_json::Value`]: object
//! literal, array, string, number, boolean, or null. A [`Codec`] turns such a
//! value into the string handed to the delivery primitive and back.
//!
//! Two codecs are provided:
//!
//! - [`JsonCodec`] delegates to `serde_json`.
//! - [`FallbackCodec`] is a self-contained recursive-descent serializer/parser
//!   for channels whose peer only understands a restricted dialect: it escapes
//!   every non-ASCII code point, accepts the bare word `undefined` as `null`,
//!   and refuses any other unquoted text.
//!
//! Values built from Rust types go through [`to_value`], which normalizes
//! symbol-like data (unit enum variants, non-string map keys) into strings.

mod fallback;

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use fallback::FallbackCodec;

/// Errors produced while encoding or decoding a payload.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The input ended in the middle of a value.
    #[error("unexpected end of input")]
    UnexpectedEnd,

    /// A character that cannot start or continue a value.
    #[error("unexpected character `{found}` at offset {offset}")]
    UnexpectedCharacter {
        /// The offending character.
        found: char,
        /// Byte offset into the input.
        offset: usize,
    },

    /// Unquoted free text that is not `true`, `false`, `null`, or `undefined`.
    #[error("invalid unquoted textual expression `{text}` at offset {offset}")]
    UnquotedText {
        /// The bare word.
        text: String,
        /// Byte offset into the input.
        offset: usize,
    },

    /// A malformed `\` escape sequence inside a string.
    #[error("invalid escape sequence at offset {offset}")]
    InvalidEscape {
        /// Byte offset into the input.
        offset: usize,
    },

    /// A number that is malformed or not representable.
    #[error("invalid number `{text}` at offset {offset}")]
    InvalidNumber {
        /// The number as written.
        text: String,
        /// Byte offset into the input.
        offset: usize,
    },

    /// Non-whitespace input after the top-level value.
    #[error("trailing characters at offset {offset}")]
    TrailingCharacters {
        /// Byte offset into the input.
        offset: usize,
    },

    /// Arrays and objects nested deeper than the parser allows.
    #[error("nesting deeper than {max} levels")]
    TooDeep {
        /// The nesting limit.
        max: usize,
    },

    /// `serde_json` rejected the input or the value.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Converts values to and from their wire representation.
pub trait Codec {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Serializes a value into a payload string.
    fn encode(&self, value: &Value) -> Result<String, CodecError>;

    /// Parses a payload string into a value.
    fn decode(&self, text: &str) -> Result<Value, CodecError>;
}

/// The codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode(&self, text: &str) -> Result<Value, CodecError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Selects a [`Codec`] implementation from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    /// [`JsonCodec`].
    #[default]
    Json,
    /// [`FallbackCodec`].
    Fallback,
}

impl CodecKind {
    /// Instantiates the selected codec.
    pub fn build(self) -> Rc<dyn Codec> {
        match self {
            Self::Json => Rc::new(JsonCodec),
            Self::Fallback => Rc::new(FallbackCodec::default()),
        }
    }
}

/// Converts any serializable Rust value into a wire [`Value`].
///
/// Symbol-like data is normalized to plain strings: unit enum variants become
/// their variant name, and integer, boolean, or character map keys become
/// their textual form. Values that have no JSON form (maps keyed by
/// compound values) are rejected.
pub fn to_value<T>(value: &T) -> Result<Value, CodecError>
where
    T: Serialize + ?Sized,
{
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    #[derive(Serialize)]
    #[serde(rename_all = "snake_case")]
    enum Shape {
        Circle,
        Square,
    }

    #[test]
    fn test_to_value_normalizes_symbol_like_values() {
        let mut keyed: BTreeMap<u32, Shape> = BTreeMap::new();
        keyed.insert(1, Shape::Circle);
        keyed.insert(2, Shape::Square);
        let value = to_value(&keyed).expect("normalizable");
        assert_eq!(value, json!({"1": "circle", "2": "square"}));
    }

    #[test]
    fn test_to_value_rejects_compound_keys() {
        let mut keyed: BTreeMap<(u8, u8), bool> = BTreeMap::new();
        keyed.insert((1, 2), true);
        assert!(to_value(&keyed).is_err());
    }

    #[test]
    fn test_json_codec_rejects_bare_words() {
        assert!(JsonCodec.decode("[1, launch_missiles]").is_err());
    }

    #[test]
    fn test_codecs_interoperate() {
        let value = json!({"text": "grüße 👋", "list": [1, -2, 3.5, null, true]});
        let native = JsonCodec.encode(&value).expect("encode");
        let fallback = FallbackCodec::default();
        assert_eq!(fallback.decode(&native).expect("decode"), value);
        let escaped = fallback.encode(&value).expect("encode");
        assert_eq!(JsonCodec.decode(&escaped).expect("decode"), value);
    }

    #[test]
    fn test_codec_kind_builds_named_codec() {
        assert_eq!(CodecKind::Json.build().name(), "json");
        assert_eq!(CodecKind::Fallback.build().name(), "fallback");
    }
}
