//! Error types shared across the server, the per-connection machine, and the
//! command parser.

use std::io;

use thiserror::Error;

/// Errors raised while loading or validating the configuration tree.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read configuration at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Unable to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors that abort server startup or the accept loop.
///
/// Per the error taxonomy these are catastrophic: none of them is surfaced to
/// a client, and `on_server_start` is never invoked once one occurs.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind listener to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS material unavailable: {0}")]
    Tls(String),

    #[error("Plugin registration failed: duplicate plugin name '{0}'")]
    DuplicatePlugin(String),

    #[error("Plugin '{plugin}' failed to start: {reason:#}")]
    PluginStart { plugin: String, reason: anyhow::Error },

    #[error("Accept failed: {0}")]
    Accept(#[from] io::Error),
}

/// Errors that end a single session without touching the rest of the server.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("Session timed out after {0} seconds")]
    Timeout(u64),
}
