//! Tunnel configuration.
//!
//! This module provides the immutable configuration snapshot handed to the
//! proxy engine at start time, plus loading and saving of TOML configuration
//! files. A new start always produces a new snapshot; snapshots are never
//! mutated after creation.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Cipher method negotiated by the proxy engine.
///
/// The engine treats this as an opaque selector; the coordinator only needs
/// to know whether the method requires credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Cipher {
    #[serde(rename = "chacha20-ietf-poly1305")]
    ChaCha20Poly1305,
    #[serde(rename = "xchacha20-ietf-poly1305")]
    XChaCha20Poly1305,
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm,
    #[serde(rename = "aes-192-gcm")]
    Aes192Gcm,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "plaintext")]
    Plaintext,
}

impl Cipher {
    /// All supported cipher methods, in display order.
    pub fn all() -> &'static [Cipher] {
        &[
            Cipher::ChaCha20Poly1305,
            Cipher::XChaCha20Poly1305,
            Cipher::Aes128Gcm,
            Cipher::Aes192Gcm,
            Cipher::Aes256Gcm,
            Cipher::Plaintext,
        ]
    }

    /// Canonical string form of the cipher method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Cipher::ChaCha20Poly1305 => "chacha20-ietf-poly1305",
            Cipher::XChaCha20Poly1305 => "xchacha20-ietf-poly1305",
            Cipher::Aes128Gcm => "aes-128-gcm",
            Cipher::Aes192Gcm => "aes-192-gcm",
            Cipher::Aes256Gcm => "aes-256-gcm",
            Cipher::Plaintext => "plaintext",
        }
    }

    /// Whether this method requires a username and password.
    pub fn requires_credentials(&self) -> bool {
        !matches!(self, Cipher::Plaintext)
    }
}

impl Default for Cipher {
    fn default() -> Self {
        Cipher::ChaCha20Poly1305
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cipher {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cipher::all()
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "cipher".to_string(),
                message: format!("unknown cipher method '{s}'"),
            })
    }
}

/// Immutable snapshot of the tunnel configuration.
///
/// Fields are passed through opaquely to the proxy engine; the coordinator
/// only validates them before use.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    /// Remote proxy server host name or address.
    pub remote_host: String,

    /// TLS SNI to present, when different from the host (default: empty)
    #[serde(default)]
    pub remote_sni: String,

    /// Remote proxy server port.
    pub remote_port: u16,

    /// Username for cipher methods that authenticate (default: empty)
    #[serde(default)]
    pub username: String,

    /// Password for cipher methods that authenticate (default: empty)
    #[serde(default)]
    pub password: String,

    /// Cipher method (default: chacha20-ietf-poly1305)
    #[serde(default)]
    pub cipher: Cipher,

    /// DNS-over-HTTPS resolver URL (default: empty, disabled)
    #[serde(default)]
    pub doh_url: String,

    /// DNS-over-TLS resolver host (default: empty, disabled)
    #[serde(default)]
    pub dot_host: String,

    /// Rate limit in bytes per second, 0 for unlimited (default: 0)
    #[serde(default)]
    pub rate_limit: u64,

    /// Connection timeout in seconds (default: 60)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u32,

    /// Enable post-quantum key agreement in the engine (default: false)
    #[serde(default)]
    pub post_quantum: bool,
}

fn default_timeout_secs() -> u32 {
    60
}

impl TunnelConfig {
    /// Validate the snapshot before it is handed to the proxy engine.
    ///
    /// Returns the first violation found; a failed validation has no side
    /// effects on the coordinator.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_host.is_empty() {
            return Err(ConfigError::MissingValue("remote_host".to_string()));
        }
        if self.remote_port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "remote_port".to_string(),
                message: "port must be non-zero".to_string(),
            });
        }
        if self.cipher.requires_credentials() {
            if self.username.is_empty() {
                return Err(ConfigError::MissingValue("username".to_string()));
            }
            if self.password.is_empty() {
                return Err(ConfigError::MissingValue("password".to_string()));
            }
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "timeout_secs".to_string(),
                message: "timeout must be non-zero".to_string(),
            });
        }
        if !self.doh_url.is_empty() {
            let url = Url::parse(&self.doh_url).map_err(|e| ConfigError::InvalidValue {
                key: "doh_url".to_string(),
                message: e.to_string(),
            })?;
            if url.scheme() != "https" {
                return Err(ConfigError::InvalidValue {
                    key: "doh_url".to_string(),
                    message: format!("expected an https URL, got scheme '{}'", url.scheme()),
                });
            }
        }
        if !self.doh_url.is_empty() && !self.dot_host.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "dot_host".to_string(),
                message: "doh_url and dot_host are mutually exclusive".to_string(),
            });
        }
        Ok(())
    }

    /// Load a configuration snapshot from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)?;
        let config: TunnelConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save the configuration snapshot to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}
