//! Configuration for the `MentorChat` development server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/mentorchat-devserver/config.toml`)
//! 4. Compiled defaults

use std::collections::BTreeMap;
use std::path::PathBuf;

use mentorchat_proto::message::UserId;

/// Errors that can occur when loading server configuration.
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
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DevConfigFile {
    server: ServerFileConfig,
    /// `[users]` table: user id to display name.
    users: BTreeMap<String, String>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the development server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "MentorChat development backend")]
pub struct DevCliArgs {
    /// Address to bind the server to.
    #[arg(short, long, env = "MENTORCHAT_DEV_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/mentorchat-devserver/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MENTORCHAT_DEV_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct DevConfig {
    /// Address to bind the server to (e.g., `127.0.0.1:8000`).
    pub bind_addr: String,
    /// Known users and their display names.
    pub users: Vec<(UserId, String)>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            users: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl DevConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &DevCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, file))
    }

    fn resolve(cli: &DevCliArgs, file: DevConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or(file.server.bind_addr)
                .unwrap_or(defaults.bind_addr),
            users: file
                .users
                .into_iter()
                .map(|(id, name)| (UserId::new(id), name))
                .collect(),
            log_level: cli.log_level.clone(),
        }
    }
}

fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<DevConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(DevConfigFile::default());
        };
        config_dir.join("mentorchat-devserver").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DevConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
