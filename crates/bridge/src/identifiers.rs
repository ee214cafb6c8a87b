//! Newtype protocol identifiers.
//!
//! Message identifiers and handler names travel over the wire as a plain
//! integer and a plain string. Wrapping them prevents accidentally passing a
//! handler name where a function name is expected, or a raw counter value where
//! an assigned message identifier is expected.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Macro for u64-wrapped newtypes.
// Generates: struct (Copy), new(), as_u64(), Display.
// ---------------------------------------------------------------------------
macro_rules! u64_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new identifier from a raw integer.
            pub fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the underlying integer value.
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

u64_id! {
    /// Correlates an outbound message with the response handler waiting for it.
    ///
    /// Assigned by the sending side from a per-instance counter starting at 0.
    /// Identifiers are never reused within the lifetime of a bridge instance.
    MessageId
}

string_id! {
    /// Name under which a callback handler is registered.
    ///
    /// User handlers take any non-empty name outside the reserved namespace;
    /// single-use response handlers are minted by the bridge itself.
    HandlerName
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_name_rejects_empty() {
        assert!(HandlerName::new("").is_none());
        assert_eq!(HandlerName::new("add").map(|n| n.to_string()), Some("add".to_string()));
    }

    #[test]
    fn test_message_id_serializes_as_bare_integer() {
        let json = serde_json::to_string(&MessageId::new(7)).expect("serialize");
        assert_eq!(json, "7");
        let back: MessageId = serde_json::from_str("7").expect("deserialize");
        assert_eq!(back.as_u64(), 7);
    }

    #[test]
    fn test_message_id_rejects_negative_and_fractional() {
        assert!(serde_json::from_str::<MessageId>("-1").is_err());
        assert!(serde_json::from_str::<MessageId>("1.5").is_err());
    }
}
