//! Agent configuration: `~/.webexec/config.json` plus the path helpers the
//! rest of the agent uses for its home and runtime directories.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ADDRESS: &str = "0.0.0.0:7777";
pub const SOCK_FILE: &str = "webexec.sock";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Public address the `/connect` endpoint listens on.
    pub address: String,
    /// How long a disconnected peer is held before it is closed.
    pub disconnect_timeout_ms: u64,
    /// Silence on a connection before it is declared failed.
    pub failed_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    /// Budget for initial ICE gathering when answering over HTTP.
    pub gathering_timeout_ms: u64,
    /// Lifetime of a pending offer in the signaling broker.
    pub offer_ttl_ms: u64,
    /// Per-pane output buffer for marker replay.
    pub buffer_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            disconnect_timeout_ms: 6_000,
            failed_timeout_ms: 6_000,
            keep_alive_interval_ms: 1_000,
            gathering_timeout_ms: 3_000,
            offer_ttl_ms: 30_000,
            buffer_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("cannot determine the home directory; $HOME is unset")]
    NoHome,
}

impl Config {
    /// Load `~/.webexec/config.json`; a missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = conf_path("config.json")?;
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn failed_timeout(&self) -> Duration {
        Duration::from_millis(self.failed_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.gathering_timeout_ms)
    }

    pub fn offer_ttl(&self) -> Duration {
        Duration::from_millis(self.offer_ttl_ms)
    }
}

fn home_dir() -> Result<PathBuf, ConfigError> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or(ConfigError::NoHome)
}

/// Full path of a file under the agent's home directory.
pub fn conf_path(suffix: &str) -> Result<PathBuf, ConfigError> {
    Ok(home_dir()?.join(".webexec").join(suffix))
}

/// Full path of a file under the agent's runtime directory.
pub fn run_path(suffix: &str) -> Result<PathBuf, ConfigError> {
    let dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join("webexec"),
        None => home_dir()?.join(".webexec").join("run"),
    };
    Ok(dir.join(suffix))
}

/// First-run bootstrap: create the home directory, a default config file and
/// an empty authorized tokens file.
pub fn ensure_home() -> Result<(), ConfigError> {
    let home = home_dir()?.join(".webexec");
    if home.exists() {
        return Ok(());
    }
    let mkdir = |path: &PathBuf, source| ConfigError::Io {
        path: path.clone(),
        source,
    };
    std::fs::create_dir_all(&home).map_err(|e| mkdir(&home, e))?;
    let config = home.join("config.json");
    std::fs::write(&config, b"{}\n").map_err(|e| mkdir(&config, e))?;
    let tokens = home.join("authorized_tokens");
    std::fs::write(&tokens, b"").map_err(|e| mkdir(&tokens, e))?;
    tracing::info!(home = %home.display(), "created agent home directory");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_timeouts() {
        let config = Config::default();
        assert_eq!(config.disconnect_timeout(), Duration::from_secs(6));
        assert_eq!(config.failed_timeout(), Duration::from_secs(6));
        assert_eq!(config.keep_alive_interval(), Duration::from_secs(1));
        assert_eq!(config.gathering_timeout(), Duration::from_secs(3));
        assert_eq!(config.offer_ttl(), Duration::from_secs(30));
        assert_eq!(config.buffer_bytes, 64 * 1024);
    }

    #[test]
    fn partial_config_keeps_defaults_for_the_rest() {
        let config: Config =
            serde_json::from_str(r#"{"address": "127.0.0.1:9000", "buffer_bytes": 1024}"#)
                .expect("parse");
        assert_eq!(config.address, "127.0.0.1:9000");
        assert_eq!(config.buffer_bytes, 1024);
        assert_eq!(config.offer_ttl_ms, 30_000);
    }
}
