//! Packet bridge worker.
//!
//! The bridge shuttles raw IP packets between the tunnel device and the
//! engine's local SOCKS5 endpoint. The forward loop itself is a black box
//! behind [`PacketRelay`]; this module owns its thread lifecycle: spawn,
//! shutdown signalling, join, and single-fire exit reporting.

use std::io;
use std::thread;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::device::TunDevice;

/// Smallest MTU the relay will accept (RFC 791 minimum reassembly size).
pub const MIN_MTU: u32 = 576;

/// Parameters handed to the packet relay for one bridge session.
#[derive(Debug, Clone)]
pub struct BridgeParams {
    /// MTU of the tunnel device (default: 1500)
    pub mtu: u32,
    /// Forward DNS queries over TCP (default: true)
    pub dns_over_tcp: bool,
    /// Verbose relay logging (default: false)
    pub verbose: bool,
}

impl Default for BridgeParams {
    fn default() -> Self {
        BridgeParams {
            mtu: 1500,
            dns_over_tcp: true,
            verbose: false,
        }
    }
}

/// Error reported by the relay, carrying the engine's numeric code.
#[derive(Debug, Clone, Error)]
#[error("relay error {code}: {message}")]
pub struct RelayError {
    pub code: i32,
    pub message: String,
}

impl RelayError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        RelayError {
            code,
            message: message.into(),
        }
    }
}

/// Black-box packet forwarding engine.
///
/// Implementations translate raw IP packets on the device into stream
/// connections against `127.0.0.1:local_port`.
pub trait PacketRelay: Send + Sync {
    /// Cheap parameter validation, run before the worker thread is spawned.
    fn check(&self, params: &BridgeParams) -> Result<(), RelayError> {
        if params.mtu < MIN_MTU {
            return Err(RelayError::new(
                -22,
                format!("mtu {} below minimum {MIN_MTU}", params.mtu),
            ));
        }
        Ok(())
    }

    /// Blocking forward loop between `device` and `127.0.0.1:local_port`.
    ///
    /// Runs until `shutdown` is cancelled or an unrecoverable I/O error
    /// occurs. Takes ownership of the device; dropping it on return closes
    /// the descriptor, so every exit path closes it exactly once.
    fn run(
        &self,
        device: TunDevice,
        local_port: u16,
        params: &BridgeParams,
        shutdown: &CancellationToken,
    ) -> Result<(), RelayError>;
}

/// Terminal status of a bridge worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeExit {
    /// The worker observed the shutdown token and wound down.
    Clean,
    /// The forward loop hit an unrecoverable error.
    Failed { code: i32, message: String },
}

impl BridgeExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, BridgeExit::Clean)
    }
}

impl From<RelayError> for BridgeExit {
    fn from(err: RelayError) -> Self {
        BridgeExit::Failed {
            code: err.code,
            message: err.message,
        }
    }
}

/// Failure to launch a bridge worker.
#[derive(Debug)]
pub enum SpawnError {
    /// The relay rejected its parameters before any thread was spawned.
    /// Ownership of the device is handed back; the caller must close it.
    Rejected { device: TunDevice, error: RelayError },
    /// The OS refused to spawn the worker thread. The device was consumed by
    /// the failed spawn and has already been closed.
    Thread(io::Error),
}

impl SpawnError {
    /// Human-readable description, for error reporting.
    pub fn message(&self) -> String {
        match self {
            SpawnError::Rejected { error, .. } => error.to_string(),
            SpawnError::Thread(e) => format!("worker thread spawn failed: {e}"),
        }
    }
}

/// Handle to a running bridge worker.
///
/// Exposes the shutdown token and the join operation. Must never outlive the
/// proxy session whose local port the worker forwards into; the coordinator
/// enforces that ordering.
pub struct BridgeHandle {
    shutdown: CancellationToken,
    thread: Option<thread::JoinHandle<()>>,
    exit_rx: Option<oneshot::Receiver<BridgeExit>>,
    exit: Option<BridgeExit>,
}

impl BridgeHandle {
    /// Clone of the worker's shutdown token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal the shutdown token and wait until the worker has exited.
    ///
    /// Idempotent: the second and later calls return the cached terminal
    /// status immediately.
    pub async fn shutdown_and_join(&mut self) -> BridgeExit {
        self.shutdown.cancel();

        if let Some(exit_rx) = self.exit_rx.take() {
            let exit = match exit_rx.await {
                Ok(exit) => exit,
                // The worker panicked before reporting.
                Err(_) => BridgeExit::Failed {
                    code: -1,
                    message: "bridge worker exited without reporting a status".to_string(),
                },
            };
            self.exit = Some(exit);
        }

        // The worker has reported, so the thread is exiting; reap it off the
        // async runtime.
        if let Some(handle) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }

        self.exit.clone().unwrap_or(BridgeExit::Clean)
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        // Safety net for a handle dropped without a join: the worker still
        // gets its shutdown signal and closes the descriptor on exit.
        self.shutdown.cancel();
    }
}

/// Launch a bridge worker on its own thread, taking ownership of `device`.
///
/// `on_exit` fires exactly once with the worker's terminal status, after the
/// status has also been made available to [`BridgeHandle::shutdown_and_join`].
pub fn spawn<R, F>(
    relay: std::sync::Arc<R>,
    device: TunDevice,
    local_port: u16,
    params: BridgeParams,
    on_exit: F,
) -> Result<BridgeHandle, SpawnError>
where
    R: PacketRelay + ?Sized + 'static,
    F: FnOnce(BridgeExit) + Send + 'static,
{
    if let Err(error) = relay.check(&params) {
        return Err(SpawnError::Rejected { device, error });
    }

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let (exit_tx, exit_rx) = oneshot::channel();

    let thread = thread::Builder::new()
        .name("packet-bridge".to_string())
        .spawn(move || {
            debug!(local_port, mtu = params.mtu, "packet bridge worker started");
            let result = relay.run(device, local_port, &params, &token);
            let exit = match result {
                Ok(()) => BridgeExit::Clean,
                Err(err) => {
                    warn!(code = err.code, message = %err.message, "packet bridge loop failed");
                    BridgeExit::from(err)
                }
            };
            let _ = exit_tx.send(exit.clone());
            on_exit(exit);
            debug!(local_port, "packet bridge worker stopped");
        })
        .map_err(SpawnError::Thread)?;

    Ok(BridgeHandle {
        shutdown,
        thread: Some(thread),
        exit_rx: Some(exit_rx),
        exit: None,
    })
}
