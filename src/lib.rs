//! Tunnel lifecycle coordination for a personal proxy client.
//!
//! This crate is the core of a personal proxy client: it owns a virtual
//! network interface descriptor, starts and stops a native proxy engine
//! exposing a local SOCKS5 endpoint, runs a packet-forwarding bridge between
//! the two, and publishes a consistent state machine plus a 1 Hz throughput
//! feed to observers.
//!
//! The platform pieces stay outside: the proxy protocol lives behind
//! [`engine::ProxyEngine`], descriptor acquisition behind
//! [`device::TunProvider`], and the packet forwarding loop behind
//! [`bridge::PacketRelay`]. The coordinator serializes caller commands and
//! cross-thread completions through a single actor task, so overlapping
//! starts, stops, and worker exits can never corrupt state or leak the
//! descriptor.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use proxytun::{TunnelCoordinator, CoordinatorOptions, TunnelConfig};
//! # use proxytun::engine::ProxyEngine;
//! # use proxytun::device::TunProvider;
//! # use proxytun::bridge::PacketRelay;
//! # async fn example(
//! #     engine: Arc<dyn ProxyEngine>,
//! #     provider: Arc<dyn TunProvider>,
//! #     relay: Arc<dyn PacketRelay>,
//! #     config: TunnelConfig,
//! # ) -> proxytun::TunnelResult<()> {
//! let coordinator =
//!     TunnelCoordinator::spawn(engine, provider, relay, CoordinatorOptions::default());
//! coordinator.start(config).await?;
//! // ... tunnel is up, observers receive rate samples ...
//! coordinator.stop().await?;
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod engine;
pub mod error;
pub mod logging;
pub mod stats;
pub mod types;

pub use config::{Cipher, TunnelConfig};
pub use coordinator::{CoordinatorOptions, TunnelCoordinator};
pub use error::{ConfigError, ErrorKind, TunnelError, TunnelResult};
pub use types::{RateSample, SessionId, TunnelEvent, TunnelState};
