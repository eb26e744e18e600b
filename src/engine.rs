//! Proxy engine seam.
//!
//! The proxy engine is a black box to the coordinator: it negotiates and
//! runs the actual proxy protocol on its own internal threads and exposes a
//! local SOCKS5 endpoint. The coordinator only starts it, stops it, and
//! polls its instantaneous throughput.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;

use crate::config::TunnelConfig;
use crate::types::{RateSample, SessionId};

/// Black-box handle to the native proxy engine.
///
/// `start` and `stop` model the engine's asynchronous completion callbacks as
/// futures; the coordinator re-serializes their completions through its own
/// command loop before touching state.
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Start the engine with the given configuration.
    ///
    /// Resolves with the local SOCKS5 port the engine bound, or the engine's
    /// error message on failure. On failure the engine holds no resources.
    async fn start(&self, config: &TunnelConfig) -> Result<u16, String>;

    /// Stop the engine and release its resources.
    async fn stop(&self) -> Result<(), String>;

    /// Instantaneous throughput snapshot.
    ///
    /// Must not block; this is called once per second from the stats poller
    /// task while the tunnel is started.
    fn query_rate(&self) -> RateSample;
}

/// A live engine session, owned exclusively by the coordinator.
///
/// Exists only between a successful engine start and the matching stop. The
/// packet bridge only ever sees the local port number, never this object.
#[derive(Debug, Clone, Copy)]
pub struct ProxySession {
    /// Id of the tunnel session this engine run belongs to.
    pub session_id: SessionId,
    /// Local port of the engine's SOCKS5 endpoint.
    pub local_port: u16,
}

impl ProxySession {
    /// Loopback address of the engine's SOCKS5 endpoint.
    pub fn socks_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.local_port)
    }
}
