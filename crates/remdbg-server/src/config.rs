use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::ServerError;

/// Server tunables.
///
/// Read from the `[server]` section of `~/.config/remdbg/config.toml` by the
/// CLI; embedding hosts construct it directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Per-session scrollback ring replayed to newly attached clients.
    /// Default: 262144 (256 KB)
    #[serde(default = "default_scrollback_buffer_size")]
    pub scrollback_buffer_size: usize,

    /// Depth of the PTY output broadcast channel; a client falling this many
    /// chunks behind skips ahead and is told how much it missed.
    /// Default: 64
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Poll interval for the chooser UI and the re-attach watcher, in
    /// milliseconds. Default: 50
    #[serde(default = "default_ui_poll_ms")]
    pub ui_poll_ms: u64,

    /// Pause after a failed accept before retrying, in milliseconds.
    /// Default: 100
    #[serde(default = "default_accept_retry_ms")]
    pub accept_retry_ms: u64,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.scrollback_buffer_size == 0 {
            return Err(ServerError::ConfigInvalid(
                "scrollback_buffer_size must be > 0".to_string(),
            ));
        }
        if self.broadcast_capacity == 0 {
            return Err(ServerError::ConfigInvalid(
                "broadcast_capacity must be > 0".to_string(),
            ));
        }
        if self.ui_poll_ms == 0 || self.ui_poll_ms > 1000 {
            return Err(ServerError::ConfigInvalid(
                "ui_poll_ms must be in 1..=1000".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            scrollback_buffer_size: default_scrollback_buffer_size(),
            broadcast_capacity: default_broadcast_capacity(),
            ui_poll_ms: default_ui_poll_ms(),
            accept_retry_ms: default_accept_retry_ms(),
        }
    }
}

fn default_scrollback_buffer_size() -> usize {
    262_144
}

fn default_broadcast_capacity() -> usize {
    64
}

fn default_ui_poll_ms() -> u64 {
    50
}

fn default_accept_retry_ms() -> u64 {
    100
}

/// Wrapper mirroring just enough of the config file to pull the `[server]`
/// section out.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    server: Option<ServerConfig>,
}

fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("remdbg").join("config.toml"))
}

/// Load the server config from the user's config file, falling back to
/// defaults when the file or section is missing or unreadable.
pub fn load_server_config() -> Result<ServerConfig, ServerError> {
    let Some(path) = config_file_path() else {
        return Ok(ServerConfig::default());
    };
    let config = match std::fs::read_to_string(&path) {
        Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
            Ok(file) => file.server.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(
                    event = "server.config.parse_failed",
                    path = %path.display(),
                    error = %e,
                );
                ServerConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ServerConfig::default(),
        Err(e) => {
            tracing::warn!(
                event = "server.config.read_failed",
                path = %path.display(),
                error = %e,
            );
            ServerConfig::default()
        }
    };
    config.validate()?;
    Ok(config)
}
