//! Unfig, the read-only configuration tree.
//!
//! The tree is TOML-shaped: `[smtp]`, `[auth]`, `[tls]`, `[log]` and a
//! free-form `[plugins]` table. Every key has a default, so an empty file (or
//! no file at all) yields a working development server on port 2525.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{error::ConfigError, logging::LogLevel};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Unfig {
    pub smtp: SmtpConfig,
    pub auth: AuthConfig,
    pub tls: TlsConfig,
    pub log: LogConfig,
    pub plugins: toml::Table,
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SmtpConfig {
    pub port: u16,
    pub listen: String,
    pub hostname: String,
    /// Seconds of client silence before the connection is closed with 421.
    pub inactivity_timeout: u64,
    /// Seconds granted to open sessions once a stop has been requested.
    pub graceful_stop_timeout: u64,
    /// Maximum message size in octets, advertised via the SIZE extension.
    /// Zero means unlimited.
    pub max_message_size: usize,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            port: 2525,
            listen: "localhost".to_string(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            inactivity_timeout: 300,
            graceful_stop_timeout: 300,
            max_message_size: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enable: bool,
    #[serde(rename = "requireTLS")]
    pub require_tls: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enable: false,
            require_tls: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    #[serde(rename = "enableStartTLS")]
    pub enable_starttls: bool,
    pub key: PathBuf,
    pub cert: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
}

impl Unfig {
    /// Load the tree from a TOML file.
    ///
    /// # Errors
    /// Fails if the file cannot be read or parsed. Unknown keys are ignored;
    /// the tree is passive and plugins may carry their own sections.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut config: Self = toml::from_str(&raw)?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        Ok(config)
    }

    /// The section for a named plugin.
    ///
    /// Starts from the inline `[plugins.<name>]` table, then overlays
    /// `<config dir>/plugins/<name>.toml` if it exists; the external file
    /// wins on key collision. Plugins with no section get an empty table.
    #[must_use]
    pub fn plugin_section(&self, name: &str) -> toml::Table {
        let mut section = match self.plugins.get(name) {
            Some(toml::Value::Table(table)) => table.clone(),
            _ => toml::Table::new(),
        };

        let external = self.base_dir.join("plugins").join(format!("{name}.toml"));
        if let Ok(raw) = std::fs::read_to_string(&external) {
            match raw.parse::<toml::Table>() {
                Ok(overrides) => {
                    for (key, value) in overrides {
                        section.insert(key, value);
                    }
                }
                Err(err) => {
                    tracing::warn!(target: "unmta", "Ignoring malformed {}: {err}", external.display());
                }
            }
        }

        section
    }
}
