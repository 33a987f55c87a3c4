//! Configuration system for the `MentorChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/mentorchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mentorchat_proto::message::UserId;
use url::Url;

use crate::net::NetConfig;
use crate::transport::reconnect::ReconnectPolicy;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A required setting was not provided anywhere.
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    /// The backend base URL is not a valid URL.
    #[error("invalid base url {url:?}: {source}")]
    InvalidUrl {
        /// The configured value.
        url: String,
        /// Parse failure.
        source: url::ParseError,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    network: NetworkFileConfig,
    reconnect: ReconnectFileConfig,
    chat: ChatFileConfig,
    ui: UiFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    base_url: Option<String>,
    user_id: Option<String>,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    max_attempts: Option<u32>,
    jitter: Option<bool>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    event_buffer: Option<usize>,
}

/// `[ui]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// Backend base URL (`http://` or `https://`).
    pub base_url: Option<String>,
    /// The logged-in user's id.
    pub user_id: Option<String>,

    // -- Network --
    /// Timeout for the push channel handshake.
    pub connect_timeout: Duration,
    /// Timeout for one REST request.
    pub request_timeout: Duration,
    /// Channel capacity for session commands.
    pub channel_capacity: usize,

    // -- Reconnect --
    /// Push channel reconnect backoff.
    pub reconnect: ReconnectPolicy,

    // -- Chat --
    /// Buffer size for the UI event channel.
    pub event_buffer: usize,

    // -- UI --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            user_id: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            channel_capacity: 256,
            reconnect: ReconnectPolicy::default(),
            event_buffer: 256,
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// CLI args and env vars are parsed via `clap`. If `--config` is given
    /// and the file does not exist, returns an error. If no `--config` is
    /// given, the default path (`~/.config/mentorchat/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. This is separated from `load()` to
    /// enable unit testing without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let reconnect_defaults = defaults.reconnect.clone();
        let reconnect = if cli.no_reconnect {
            ReconnectPolicy::disabled()
        } else {
            ReconnectPolicy {
                initial_delay: file
                    .reconnect
                    .initial_delay_ms
                    .map_or(reconnect_defaults.initial_delay, Duration::from_millis),
                max_delay: file
                    .reconnect
                    .max_delay_ms
                    .map_or(reconnect_defaults.max_delay, Duration::from_millis),
                multiplier: file
                    .reconnect
                    .multiplier
                    .unwrap_or(reconnect_defaults.multiplier),
                max_attempts: file
                    .reconnect
                    .max_attempts
                    .unwrap_or(reconnect_defaults.max_attempts),
                jitter: file.reconnect.jitter.unwrap_or(reconnect_defaults.jitter),
            }
        };

        Self {
            base_url: cli
                .base_url
                .clone()
                .or_else(|| file.server.base_url.clone()),
            user_id: cli.user_id.clone().or_else(|| file.server.user_id.clone()),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            request_timeout: file
                .network
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            reconnect,
            event_buffer: file.chat.event_buffer.unwrap_or(defaults.event_buffer),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// Build a [`NetConfig`] from this configuration.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Missing`] if `base_url` or `user_id` is unset or empty.
    /// - [`ConfigError::InvalidUrl`] if `base_url` does not parse.
    pub fn to_net_config(&self) -> Result<NetConfig, ConfigError> {
        let base_url = self
            .base_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("base_url"))?;
        let user_id = self
            .user_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("user_id"))?;
        let base_url = Url::parse(base_url).map_err(|source| ConfigError::InvalidUrl {
            url: base_url.to_string(),
            source,
        })?;

        Ok(NetConfig {
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            channel_capacity: self.channel_capacity,
            event_buffer: self.event_buffer,
            reconnect: self.reconnect.clone(),
            ..NetConfig::new(base_url, UserId::new(user_id))
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Console client for MentorChat conversations")]
pub struct CliArgs {
    /// Backend base URL (e.g. `http://127.0.0.1:8000`).
    #[arg(long, env = "MENTORCHAT_URL")]
    pub base_url: Option<String>,

    /// Your user id.
    #[arg(long, env = "MENTORCHAT_USER")]
    pub user_id: Option<String>,

    /// Path to config file (default: `~/.config/mentorchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MENTORCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/mentorchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Do not reconnect the push channel after it drops.
    #[arg(long)]
    pub no_reconnect: bool,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("mentorchat").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
