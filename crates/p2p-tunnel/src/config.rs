//! Tunnel configuration.
//!
//! Deserializable from the `[tunnel]` section of a TOML config file; every
//! field has a default so an empty section is valid.

use p2p_tunnel_core::{TunnelError, TunnelResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do when a listener is created for a protocol name that already
/// has an active listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolConflict {
    /// Overwrite the registry entry and leave the previous listener running.
    Replace,
    /// Close the previous listener, then install the new one.
    #[default]
    ClosePrevious,
    /// Fail the new listener with [`TunnelError::ProtocolInUse`].
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TunnelConfig {
    /// Bound on establishing a peer connection for an outbound tunnel.
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    #[serde(default)]
    pub on_conflict: ProtocolConflict,
    /// Per-direction copy buffer of each session.
    #[serde(default = "default_copy_buffer_size")]
    pub copy_buffer_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: default_dial_timeout_secs(),
            on_conflict: ProtocolConflict::default(),
            copy_buffer_size: default_copy_buffer_size(),
        }
    }
}

fn default_dial_timeout_secs() -> u64 {
    30
}
fn default_copy_buffer_size() -> usize {
    8 * 1024
}

impl TunnelConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Reject values the tunnel layer cannot run with.
    pub fn validate(&self) -> TunnelResult<()> {
        if self.dial_timeout_secs == 0 {
            return Err(TunnelError::Config("dial_timeout_secs must be > 0".into()));
        }
        if self.copy_buffer_size == 0 {
            return Err(TunnelError::Config("copy_buffer_size must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TunnelConfig::default();
        assert_eq!(config.dial_timeout(), Duration::from_secs(30));
        assert_eq!(config.on_conflict, ProtocolConflict::ClosePrevious);
        assert_eq!(config.copy_buffer_size, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: TunnelConfig = toml::from_str("").unwrap();
        assert_eq!(config, TunnelConfig::default());
    }

    #[test]
    fn test_parse_toml() {
        let config: TunnelConfig = toml::from_str(
            r#"
            dial_timeout_secs = 5
            on_conflict = "reject"
            "#,
        )
        .unwrap();
        assert_eq!(config.dial_timeout_secs, 5);
        assert_eq!(config.on_conflict, ProtocolConflict::Reject);
        assert_eq!(config.copy_buffer_size, 8192);
    }

    #[test]
    fn test_conflict_names() {
        for (name, expected) in [
            ("\"replace\"", ProtocolConflict::Replace),
            ("\"close-previous\"", ProtocolConflict::ClosePrevious),
            ("\"reject\"", ProtocolConflict::Reject),
        ] {
            let parsed: ProtocolConflict = serde_json::from_str(name).unwrap();
            assert_eq!(parsed, expected);
        }
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = TunnelConfig {
            dial_timeout_secs: 0,
            ..TunnelConfig::default()
        };
        assert!(matches!(config.validate(), Err(TunnelError::Config(_))));

        let config = TunnelConfig {
            copy_buffer_size: 0,
            ..TunnelConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
