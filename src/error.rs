//! Error types for the tunnel lifecycle coordinator.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Errors surfaced by the tunnel lifecycle coordinator.
///
/// Every failure branch leaves the coordinator in `Stopped` with no dangling
/// descriptor, worker thread, or engine session before the error is reported.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Local validation failure; reported synchronously with no side effects.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Start issued while a tunnel session already exists.
    #[error("Tunnel is already running")]
    AlreadyRunning,

    /// Stop issued with no tunnel session to tear down.
    #[error("Tunnel is not running")]
    NotRunning,

    /// The proxy engine reported a start failure.
    #[error("Proxy engine failed to start: {0}")]
    EngineStartFailed(String),

    /// The proxy engine reported a stop failure. State is forced to
    /// `Stopped` anyway.
    #[error("Proxy engine failed to stop: {0}")]
    EngineStopFailed(String),

    /// The tunnel descriptor request was denied by the user or OS.
    #[error("Tunnel device request denied{}", display_reason(.0))]
    TunnelDenied(Option<String>),

    /// The tunnel descriptor could not be acquired.
    #[error("Tunnel device unavailable: {0}")]
    TunnelUnavailable(String),

    /// The packet bridge could not be initialized or its worker thread could
    /// not be spawned.
    #[error("Packet bridge failed to initialize: {0}")]
    BridgeInitFailed(String),

    /// The packet bridge worker exited on its own while the tunnel was
    /// started. Treated as an implicit stop, not a fatal condition.
    #[error("Tunnel closed unexpectedly: {0}")]
    UnexpectedTunnelClosure(String),

    /// The coordinator has been shut down and accepts no further commands.
    #[error("Coordinator is shut down")]
    Closed,
}

fn display_reason(reason: &Option<String>) -> String {
    match reason {
        Some(r) => format!(": {r}"),
        None => String::new(),
    }
}

/// Coarse classification of a [`TunnelError`], carried on error events so
/// observers can dispatch without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidConfig,
    AlreadyRunning,
    NotRunning,
    EngineStartFailed,
    EngineStopFailed,
    TunnelDenied,
    TunnelUnavailable,
    BridgeInitFailed,
    UnexpectedTunnelClosure,
    Closed,
}

impl TunnelError {
    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            TunnelError::AlreadyRunning => ErrorKind::AlreadyRunning,
            TunnelError::NotRunning => ErrorKind::NotRunning,
            TunnelError::EngineStartFailed(_) => ErrorKind::EngineStartFailed,
            TunnelError::EngineStopFailed(_) => ErrorKind::EngineStopFailed,
            TunnelError::TunnelDenied(_) => ErrorKind::TunnelDenied,
            TunnelError::TunnelUnavailable(_) => ErrorKind::TunnelUnavailable,
            TunnelError::BridgeInitFailed(_) => ErrorKind::BridgeInitFailed,
            TunnelError::UnexpectedTunnelClosure(_) => ErrorKind::UnexpectedTunnelClosure,
            TunnelError::Closed => ErrorKind::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_display_with_and_without_reason() {
        let bare = TunnelError::TunnelDenied(None);
        assert_eq!(bare.to_string(), "Tunnel device request denied");

        let reasoned = TunnelError::TunnelDenied(Some("user cancelled".to_string()));
        assert_eq!(
            reasoned.to_string(),
            "Tunnel device request denied: user cancelled"
        );
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            TunnelError::EngineStartFailed("boom".into()).kind(),
            ErrorKind::EngineStartFailed
        );
        assert_eq!(TunnelError::NotRunning.kind(), ErrorKind::NotRunning);
        assert_eq!(
            TunnelError::UnexpectedTunnelClosure("gone".into()).kind(),
            ErrorKind::UnexpectedTunnelClosure
        );
    }
}
