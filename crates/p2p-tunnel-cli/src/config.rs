//! CLI configuration: TOML file + CLI overrides.

use p2p_tunnel::TunnelConfig;
use p2p_tunnel_core::{TunnelError, TunnelResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub loopback: Vec<LoopbackEntry>,
}

/// One `[[loopback]]` tunnel: `target` is exposed by the serving peer under
/// `protocol` and reachable through `listen` on the client peer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoopbackEntry {
    pub protocol: String,
    pub target: String,
    pub listen: String,
}

impl ConfigFile {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file yields the defaults.
    pub fn load(config_path: Option<&Path>, cli_dial_timeout: Option<u64>) -> TunnelResult<Self> {
        let mut config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| TunnelError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        if let Some(secs) = cli_dial_timeout {
            config.tunnel.dial_timeout_secs = secs;
        }
        config.tunnel.validate()?;
        Ok(config)
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2p_tunnel::ProtocolConflict;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        let config = ConfigFile::load(Some(&path), None).unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_no_path_uses_defaults() {
        let config = ConfigFile::load(None, None).unwrap();
        assert_eq!(config.tunnel.dial_timeout_secs, 30);
        assert!(config.loopback.is_empty());
    }

    #[test]
    fn test_load_full_file() {
        let file = write_config(
            r#"
[tunnel]
dial_timeout_secs = 5
on_conflict = "reject"

[[loopback]]
protocol = "/x/ssh"
target = "/ip4/127.0.0.1/tcp/22"
listen = "/ip4/127.0.0.1/tcp/2222"

[[loopback]]
protocol = "/x/web"
target = "/ip4/127.0.0.1/tcp/8080"
listen = "/ip4/127.0.0.1/tcp/0"
"#,
        );
        let config = ConfigFile::load(Some(file.path()), None).unwrap();
        assert_eq!(config.tunnel.dial_timeout_secs, 5);
        assert_eq!(config.tunnel.on_conflict, ProtocolConflict::Reject);
        assert_eq!(config.tunnel.copy_buffer_size, 8192);
        assert_eq!(config.loopback.len(), 2);
        assert_eq!(config.loopback[0].protocol, "/x/ssh");
        assert_eq!(config.loopback[1].listen, "/ip4/127.0.0.1/tcp/0");
    }

    #[test]
    fn test_cli_override_wins() {
        let file = write_config("[tunnel]\ndial_timeout_secs = 5\n");
        let config = ConfigFile::load(Some(file.path()), Some(12)).unwrap();
        assert_eq!(config.tunnel.dial_timeout_secs, 12);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let file = write_config("[tunnel\n");
        let err = ConfigFile::load(Some(file.path()), None).unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = ConfigFile::load(None, Some(0)).unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
    }

    #[test]
    fn test_expand_tilde() {
        let plain = Path::new("/etc/p2ptun.toml");
        assert_eq!(expand_tilde(plain), plain);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_tilde(Path::new("~/.p2ptun/config.toml")),
                home.join(".p2ptun/config.toml")
            );
        }
    }
}
