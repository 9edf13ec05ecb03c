//! Configuration system for the ICB bridge.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/icb-bridge/config.toml`)
//! 4. Compiled defaults
//!
//! The config file is read as a flat set of dotted keys, so both
//!
//! ```toml
//! [icb]
//! server = "icb.example.org"
//! ```
//!
//! and `icb.server = "icb.example.org"` resolve to the key `icb.server`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::transactions::EchoPolicy;

/// Default ICB server port.
pub const DEFAULT_ICB_PORT: u16 = 7326;

/// Default address the transaction receiver binds to.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9000";

/// Default user ID prefix of the bridge's own Matrix users.
pub const DEFAULT_USER_PREFIX: &str = "@icb.";

/// Errors that can occur when loading bridge configuration.
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

    /// A required key is absent or empty.
    #[error("missing required config key `{0}`")]
    Missing(&'static str),

    /// `icb.port` is not a valid port number.
    #[error("invalid icb.port `{0}`")]
    InvalidPort(String),

    /// `bridge.echo_policy` names no known policy.
    #[error("invalid bridge.echo_policy `{0}` (expected `halt-batch` or `skip-event`)")]
    InvalidEchoPolicy(String),
}

// ---------------------------------------------------------------------------
// Config file
// ---------------------------------------------------------------------------

/// Key/value view of the bridge config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeConfig {
    values: HashMap<String, String>,
}

impl BridgeConfig {
    /// Load the config file.
    ///
    /// If `explicit_path` is given and the file does not exist, returns an
    /// error. Otherwise the default path is tried and a missing file is
    /// treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = if let Some(p) = explicit_path {
            let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
                path: p.to_path_buf(),
                source: e,
            })?;
            return Self::parse(&contents);
        } else {
            let Some(config_dir) = dirs::config_dir() else {
                return Ok(Self::default());
            };
            config_dir.join("icb-bridge").join("config.toml")
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::ReadFile { path, source: e }),
        }
    }

    /// Parse TOML text into a flat key/value config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseToml`] on invalid TOML.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(contents)?;
        let mut values = HashMap::new();
        flatten("", &table, &mut values);
        Ok(Self { values })
    }

    /// Returns the value for `key`, or an empty string if absent.
    #[must_use]
    pub fn get(&self, key: &str) -> &str {
        self.values.get(key).map_or("", String::as_str)
    }

    /// Returns the value for `key`, or `default` if absent or empty.
    #[must_use]
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.get(key) {
            "" => default,
            value => value,
        }
    }

    /// Sets `key`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut HashMap<String, String>) {
    for (key, value) in table {
        let full_key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(inner) => flatten(&full_key, inner, out),
            toml::Value::String(s) => {
                out.insert(full_key, s.trim().to_string());
            }
            toml::Value::Integer(i) => {
                out.insert(full_key, i.to_string());
            }
            toml::Value::Float(f) => {
                out.insert(full_key, f.to_string());
            }
            toml::Value::Boolean(b) => {
                out.insert(full_key, b.to_string());
            }
            toml::Value::Datetime(d) => {
                out.insert(full_key, d.to_string());
            }
            toml::Value::Array(_) => {
                tracing::debug!(key = %full_key, "ignoring array config value");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the bridge.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Bridge an ICB group into a Matrix room")]
pub struct BridgeCliArgs {
    /// Path to config file (default: `~/.config/icb-bridge/config.toml`).
    ///
    /// The file is TOML, so string values must be quoted: `icb.server = "host"`.
    /// Older flat files with bare values (`icb.server = host`) are rejected.
    #[arg(short, long, env = "ICB_BRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print the application-service registration for the home server and exit.
    #[arg(long)]
    pub genyaml: bool,

    /// Address the transaction receiver binds to.
    #[arg(short, long, env = "ICB_BRIDGE_BIND")]
    pub bind: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "ICB_BRIDGE_LOG")]
    pub log_level: String,

    /// Write logs to this file instead of standard output.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved settings
// ---------------------------------------------------------------------------

/// Fully resolved bridge settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    /// ICB server address (`host:port`).
    pub server_addr: String,
    /// Nickname the bridge logs in with.
    pub nick: String,
    /// Group the bridge joins.
    pub group: String,
    /// Address the transaction receiver binds to.
    pub bind_addr: String,
    /// User ID prefix marking events the bridge itself sent.
    pub user_prefix: String,
    /// Token the home server must present; empty disables the check.
    pub hs_token: String,
    /// What to do with a bridge-originated event in a transaction.
    pub echo_policy: EchoPolicy,
    /// Log level filter string.
    pub log_level: String,
}

impl BridgeSettings {
    /// Resolve settings from CLI args and the config file.
    ///
    /// Priority: CLI > file > default.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `icb.server`, `icb.nick` or `icb.group`
    /// is missing, or if the port or echo policy is invalid.
    pub fn resolve(cli: &BridgeCliArgs, file: &BridgeConfig) -> Result<Self, ConfigError> {
        let server = required(file, "icb.server")?;
        let port = match file.get("icb.port") {
            "" => DEFAULT_ICB_PORT,
            raw => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(raw.to_string()))?,
        };
        let echo_policy = match file.get("bridge.echo_policy") {
            "" => EchoPolicy::default(),
            raw => raw
                .parse()
                .map_err(|()| ConfigError::InvalidEchoPolicy(raw.to_string()))?,
        };

        Ok(Self {
            server_addr: format!("{server}:{port}"),
            nick: required(file, "icb.nick")?.to_string(),
            group: required(file, "icb.group")?.to_string(),
            bind_addr: cli
                .bind
                .clone()
                .unwrap_or_else(|| file.get_or("bridge.bind", DEFAULT_BIND_ADDR).to_string()),
            user_prefix: file
                .get_or("bridge.user_prefix", DEFAULT_USER_PREFIX)
                .to_string(),
            hs_token: file.get("bridge.hs_token").to_string(),
            echo_policy,
            log_level: cli.log_level.clone(),
        })
    }
}

fn required<'a>(file: &'a BridgeConfig, key: &'static str) -> Result<&'a str, ConfigError> {
    match file.get(key) {
        "" => Err(ConfigError::Missing(key)),
        value => Ok(value),
    }
}
