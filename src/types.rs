//! Type definitions shared across the tunnel coordinator.

use std::fmt;

use uuid::Uuid;

use crate::error::ErrorKind;

/// Unique identifier for a tunnel session.
///
/// A fresh id is minted on every start; it names the session toward the
/// descriptor provider and correlates log lines across subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Mint a new random session id.
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of the tunnel lifecycle coordinator.
///
/// Transitions are totally ordered:
/// `Stopped -> Starting -> Started -> Stopping -> Stopped`, with the single
/// shortcut `Starting -> Stopped` on a failed start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// No tunnel session exists; Start is accepted.
    Stopped,
    /// A start sequence is in flight (engine, then descriptor, then bridge).
    Starting,
    /// Engine, descriptor, and bridge are all up; Stop is accepted.
    Started,
    /// A teardown sequence is in flight (bridge first, then engine).
    Stopping,
}

/// Point-in-time throughput snapshot pulled from the proxy engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateSample {
    /// Number of active proxied connections.
    pub connections: u64,
    /// Receive rate in bytes per second.
    pub rx_rate: u64,
    /// Transmit rate in bytes per second.
    pub tx_rate: u64,
}

/// Events published to coordinator observers.
///
/// Delivery happens on an unspecified runtime thread; subscribers marshal to
/// their own context (e.g. a UI thread) as needed.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// The coordinator moved to a new state.
    StateChanged(TunnelState),
    /// A fresh throughput sample from the stats poller.
    Rate(RateSample),
    /// A failure was surfaced; the coordinator has already rolled back.
    Error { kind: ErrorKind, message: String },
}
