//! Per-instance bridge configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::CodecKind;
use crate::BridgeError;

/// Default prefix of every reserved handler name.
pub const DEFAULT_NAMESPACE: &str = "Bridge";

/// Default bound on attempts to mint a unique internal handler name.
pub const DEFAULT_HANDLER_NAME_ATTEMPTS: u32 = 16;

/// Settings for one side of the bridge.
///
/// Loaded from JSON; every field is optional.
///
/// ```json
/// { "namespace": "Bridge", "codec": "fallback", "acknowledge_inbound": true }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Prefix of the reserved handler names (`<namespace>.receive`, ...).
    pub namespace: String,

    /// Codec used for every payload on this side.
    pub codec: CodecKind,

    /// Send `<namespace>.ack` after each inbound message. Required when the
    /// peer sends through the throttled adapter.
    pub acknowledge_inbound: bool,

    /// How many random names to try before giving up on minting a unique
    /// internal handler name.
    pub handler_name_attempts: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            codec: CodecKind::default(),
            acknowledge_inbound: false,
            handler_name_attempts: DEFAULT_HANDLER_NAME_ATTEMPTS,
        }
    }
}

impl BridgeConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json_str(text: &str) -> Result<Self, BridgeError> {
        let config: Self = serde_json::from_str(text).map_err(|e| BridgeError::Configuration {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| BridgeError::Configuration {
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_json_str(&text)
    }

    /// Checks the invariants serde cannot express.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let namespace_ok = !self.namespace.is_empty()
            && self
                .namespace
                .split('.')
                .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        if !namespace_ok {
            return Err(BridgeError::Configuration {
                message: format!("invalid namespace `{}`", self.namespace),
            });
        }
        if self.handler_name_attempts == 0 {
            return Err(BridgeError::Configuration {
                message: "handler_name_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// The reserved name `<namespace>.<suffix>`.
    pub fn reserved(&self, suffix: &str) -> String {
        format!("{}.{suffix}", self.namespace)
    }

    /// Whether `name` lies inside the reserved namespace.
    pub fn is_reserved(&self, name: &str) -> bool {
        name.strip_prefix(self.namespace.as_str())
            .is_some_and(|rest| rest.starts_with('.'))
    }
}
