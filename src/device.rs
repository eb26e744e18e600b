//! Tunnel device descriptor and its provider seam.
//!
//! Acquiring the descriptor is a privileged platform call (it may prompt the
//! user) and lives outside this crate; the coordinator only consumes the
//! resulting owned descriptor and hands it to the packet bridge worker.

use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use async_trait::async_trait;
use thiserror::Error;

use crate::error::TunnelError;

/// Owned descriptor for the virtual network interface.
///
/// The descriptor has exactly one owner at every instant: the provider until
/// it is handed over, then the bridge worker until the worker exits. Dropping
/// the device closes the descriptor; because ownership is linear, it is
/// closed exactly once.
#[derive(Debug)]
pub struct TunDevice {
    fd: OwnedFd,
}

impl TunDevice {
    /// Wrap an already-acquired descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        TunDevice { fd }
    }
}

impl AsRawFd for TunDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<OwnedFd> for TunDevice {
    fn from(fd: OwnedFd) -> Self {
        TunDevice::new(fd)
    }
}

impl From<File> for TunDevice {
    fn from(file: File) -> Self {
        TunDevice::new(file.into())
    }
}

/// Failure to obtain a tunnel descriptor.
#[derive(Debug, Clone, Error)]
pub enum TunAcquireError {
    /// The user or OS refused the request.
    #[error("tunnel device denied{}", match .reason { Some(r) => format!(": {r}"), None => String::new() })]
    Denied { reason: Option<String> },

    /// The platform call failed.
    #[error("tunnel device unavailable: {reason}")]
    Unavailable { reason: String },
}

impl From<TunAcquireError> for TunnelError {
    fn from(err: TunAcquireError) -> Self {
        match err {
            TunAcquireError::Denied { reason } => TunnelError::TunnelDenied(reason),
            TunAcquireError::Unavailable { reason } => TunnelError::TunnelUnavailable(reason),
        }
    }
}

/// Provider of tunnel descriptors.
///
/// A real implementation wraps the platform's permission-prompt-then-callback
/// flow; the coordinator awaits it off its command loop, so a slow prompt
/// never blocks state queries.
#[async_trait]
pub trait TunProvider: Send + Sync {
    /// Request a descriptor for a session routing through
    /// `127.0.0.1:local_port`.
    async fn acquire(
        &self,
        session_name: &str,
        local_port: u16,
    ) -> Result<TunDevice, TunAcquireError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_wraps_fd() {
        let file = File::open("/dev/null").unwrap();
        let raw = file.as_raw_fd();
        let device = TunDevice::from(file);
        assert_eq!(device.as_raw_fd(), raw);
    }

    #[test]
    fn test_acquire_error_maps_to_tunnel_error() {
        let denied: TunnelError = TunAcquireError::Denied { reason: None }.into();
        assert!(matches!(denied, TunnelError::TunnelDenied(None)));

        let unavailable: TunnelError = TunAcquireError::Unavailable {
            reason: "no tun module".to_string(),
        }
        .into();
        assert!(matches!(unavailable, TunnelError::TunnelUnavailable(_)));
    }
}
