//! Tunnel lifecycle coordinator.
//!
//! Single source of truth for [`TunnelState`]. All state mutations and the
//! decisions to start or stop subsystems happen on one actor task; caller
//! commands and cross-thread completions (engine callbacks, bridge worker
//! exit) are posted onto its channels rather than mutating shared state
//! directly, so no two transitions can ever interleave.
//!
//! Start sequence: validate config, start the proxy engine, acquire the
//! tunnel descriptor, launch the packet bridge worker, arm the stats poller.
//! Stop reverses it: disarm the poller, quiesce and join the bridge, then
//! stop the engine. The bridge is always torn down before the engine because
//! it actively writes into the engine's local port.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::bridge::{self, BridgeExit, BridgeHandle, BridgeParams, PacketRelay, SpawnError};
use crate::config::TunnelConfig;
use crate::device::TunProvider;
use crate::engine::{ProxyEngine, ProxySession};
use crate::error::{TunnelError, TunnelResult};
use crate::stats::StatsPoller;
use crate::types::{RateSample, SessionId, TunnelEvent, TunnelState};

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Parameters for the packet bridge worker.
    pub bridge: BridgeParams,
    /// Capacity of the observer event channel; lagging subscribers lose the
    /// oldest events.
    pub event_capacity: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        CoordinatorOptions {
            bridge: BridgeParams::default(),
            event_capacity: 64,
        }
    }
}

enum Command {
    Start(Box<TunnelConfig>, oneshot::Sender<TunnelResult<()>>),
    Stop(oneshot::Sender<TunnelResult<()>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cross-thread completions, re-dispatched through the actor.
enum Internal {
    BridgeExited { generation: u64, exit: BridgeExit },
}

/// Cloneable handle to a running coordinator.
///
/// `start`/`stop` complete when the terminal state has been reached; queries
/// are lock-free reads that never block and are safe from any thread.
#[derive(Clone)]
pub struct TunnelCoordinator {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<TunnelState>,
    sample_rx: watch::Receiver<Option<RateSample>>,
    events: broadcast::Sender<TunnelEvent>,
}

impl TunnelCoordinator {
    /// Spawn a coordinator actor over the given collaborators.
    pub fn spawn(
        engine: Arc<dyn ProxyEngine>,
        provider: Arc<dyn TunProvider>,
        relay: Arc<dyn PacketRelay>,
        options: CoordinatorOptions,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TunnelState::Stopped);
        let (sample_tx, sample_rx) = watch::channel(None);
        let (events, _) = broadcast::channel(options.event_capacity);

        let actor = Actor {
            engine,
            provider,
            relay,
            bridge_params: options.bridge,
            state_tx,
            sample_tx,
            events: events.clone(),
            internal_tx,
            session: None,
            generation: 0,
        };
        tokio::spawn(actor.run(command_rx, internal_rx));

        TunnelCoordinator {
            commands: command_tx,
            state_rx,
            sample_rx,
            events,
        }
    }

    /// Start a tunnel session with the given configuration snapshot.
    ///
    /// Completes once the tunnel is `Started`, or with the failure after the
    /// coordinator has rolled everything back to `Stopped`.
    pub async fn start(&self, config: TunnelConfig) -> TunnelResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Start(Box::new(config), reply_tx))
            .await
            .map_err(|_| TunnelError::Closed)?;
        reply_rx.await.map_err(|_| TunnelError::Closed)?
    }

    /// Stop the running tunnel session.
    ///
    /// Issued during `Starting`, the command queues behind the in-flight
    /// start and runs once it has resolved; a start and a stop never race.
    pub async fn stop(&self) -> TunnelResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Stop(reply_tx))
            .await
            .map_err(|_| TunnelError::Closed)?;
        reply_rx.await.map_err(|_| TunnelError::Closed)?
    }

    /// Current tunnel state. Never blocks.
    pub fn state(&self) -> TunnelState {
        *self.state_rx.borrow()
    }

    /// Most recent rate sample, if the poller has published one. Never
    /// blocks.
    pub fn last_sample(&self) -> Option<RateSample> {
        *self.sample_rx.borrow()
    }

    /// Watch channel over the tunnel state, for callers that want to await
    /// transitions instead of polling.
    pub fn watch_state(&self) -> watch::Receiver<TunnelState> {
        self.state_rx.clone()
    }

    /// Subscribe to the observer event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Tear down any running session and terminate the actor.
    ///
    /// Safe to call twice; a second call returns immediately.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

/// One live tunnel session: the engine run, its bridge worker, and the
/// armed poller. At most one exists at any time.
struct ActiveSession {
    generation: u64,
    proxy: ProxySession,
    bridge: BridgeHandle,
    poller: StatsPoller,
}

struct Actor {
    engine: Arc<dyn ProxyEngine>,
    provider: Arc<dyn TunProvider>,
    relay: Arc<dyn PacketRelay>,
    bridge_params: BridgeParams,
    state_tx: watch::Sender<TunnelState>,
    sample_tx: watch::Sender<Option<RateSample>>,
    events: broadcast::Sender<TunnelEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    session: Option<ActiveSession>,
    /// Bumped on every bridge launch; stale worker-exit notifications are
    /// recognized by generation mismatch.
    generation: u64,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start(config, reply)) => {
                        let _ = reply.send(self.handle_start(*config).await);
                    }
                    Some(Command::Stop(reply)) => {
                        let _ = reply.send(self.handle_stop().await);
                    }
                    Some(Command::Shutdown(reply)) => {
                        if self.session.is_some() {
                            let _ = self.handle_stop().await;
                        }
                        let _ = reply.send(());
                        break;
                    }
                    // every handle dropped: same as shutdown
                    None => {
                        if self.session.is_some() {
                            let _ = self.handle_stop().await;
                        }
                        break;
                    }
                },
                Some(event) = internal_rx.recv() => {
                    self.handle_internal(event).await;
                }
            }
        }
        debug!("coordinator actor terminated");
    }

    async fn handle_start(&mut self, config: TunnelConfig) -> TunnelResult<()> {
        // Fail fast with no side effects; no state change on bad config or
        // wrong state.
        config.validate()?;
        if *self.state_tx.borrow() != TunnelState::Stopped {
            return Err(TunnelError::AlreadyRunning);
        }

        let session_id = SessionId::new();
        info!(
            session_id = %session_id,
            remote_host = %config.remote_host,
            remote_port = config.remote_port,
            cipher = %config.cipher,
            "starting tunnel"
        );
        self.set_state(TunnelState::Starting);

        let local_port = match self.engine.start(&config).await {
            Ok(port) => port,
            Err(message) => {
                warn!(session_id = %session_id, error = %message, "proxy engine start failed");
                self.set_state(TunnelState::Stopped);
                return Err(self.emit_error(TunnelError::EngineStartFailed(message)));
            }
        };
        debug!(session_id = %session_id, local_port, "proxy engine started");

        let device = match self
            .provider
            .acquire(&session_id.to_string(), local_port)
            .await
        {
            Ok(device) => device,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "tunnel device not granted");
                self.stop_engine_best_effort().await;
                self.set_state(TunnelState::Stopped);
                return Err(self.emit_error(err.into()));
            }
        };

        self.generation += 1;
        let generation = self.generation;
        let notify = self.internal_tx.clone();
        let bridge = match bridge::spawn(
            self.relay.clone(),
            device,
            local_port,
            self.bridge_params.clone(),
            move |exit| {
                let _ = notify.send(Internal::BridgeExited { generation, exit });
            },
        ) {
            Ok(handle) => handle,
            Err(err) => {
                let message = err.message();
                warn!(session_id = %session_id, error = %message, "packet bridge launch failed");
                // Rejected hands the descriptor back; dropping it here is
                // the close the bridge never got to do.
                if let SpawnError::Rejected { device, .. } = err {
                    drop(device);
                }
                self.stop_engine_best_effort().await;
                self.set_state(TunnelState::Stopped);
                return Err(self.emit_error(TunnelError::BridgeInitFailed(message)));
            }
        };

        self.set_state(TunnelState::Started);
        let poller = StatsPoller::arm(
            self.engine.clone(),
            self.events.clone(),
            self.sample_tx.clone(),
        );
        self.session = Some(ActiveSession {
            generation,
            proxy: ProxySession {
                session_id,
                local_port,
            },
            bridge,
            poller,
        });
        info!(session_id = %session_id, local_port, "tunnel started");
        Ok(())
    }

    async fn handle_stop(&mut self) -> TunnelResult<()> {
        let Some(session) = self.session.take() else {
            return Err(TunnelError::NotRunning);
        };
        let ActiveSession {
            proxy,
            mut bridge,
            poller,
            ..
        } = session;

        info!(session_id = %proxy.session_id, "stopping tunnel");
        self.set_state(TunnelState::Stopping);

        poller.disarm().await;

        // Bridge before engine: the worker actively writes into the engine's
        // local port and must be quiesced first.
        let exit = bridge.shutdown_and_join().await;
        if let BridgeExit::Failed { code, message } = &exit {
            warn!(
                session_id = %proxy.session_id,
                code,
                message = %message,
                "packet bridge exited with error during stop"
            );
        }

        let result = match self.engine.stop().await {
            Ok(()) => Ok(()),
            // Best effort: surface the failure but land in Stopped anyway
            // rather than getting stuck.
            Err(message) => {
                warn!(session_id = %proxy.session_id, error = %message, "proxy engine stop failed");
                Err(self.emit_error(TunnelError::EngineStopFailed(message)))
            }
        };

        self.sample_tx.send_replace(None);
        self.set_state(TunnelState::Stopped);
        info!(session_id = %proxy.session_id, "tunnel stopped");
        result
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::BridgeExited { generation, exit } => {
                let live = self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.generation == generation);
                if !live {
                    // Exit report from a session already torn down by a
                    // deliberate stop.
                    debug!(generation, "ignoring stale bridge exit notification");
                    return;
                }
                self.handle_unexpected_closure(exit).await;
            }
        }
    }

    /// The bridge worker died on its own while the tunnel was started:
    /// implicit stop, surfaced as `UnexpectedTunnelClosure` exactly once.
    async fn handle_unexpected_closure(&mut self, exit: BridgeExit) {
        let Some(session) = self.session.take() else {
            return;
        };
        let ActiveSession {
            proxy,
            mut bridge,
            poller,
            ..
        } = session;

        let message = match &exit {
            BridgeExit::Clean => "packet bridge exited".to_string(),
            BridgeExit::Failed { code, message } => {
                format!("packet bridge failed ({code}): {message}")
            }
        };
        warn!(session_id = %proxy.session_id, message = %message, "unexpected tunnel closure");

        self.set_state(TunnelState::Stopping);
        poller.disarm().await;
        // The worker has already exited; this just reaps the thread.
        let _ = bridge.shutdown_and_join().await;
        self.stop_engine_best_effort().await;
        self.sample_tx.send_replace(None);
        self.set_state(TunnelState::Stopped);

        self.emit_error(TunnelError::UnexpectedTunnelClosure(message));
    }

    async fn stop_engine_best_effort(&mut self) {
        if let Err(message) = self.engine.stop().await {
            warn!(error = %message, "proxy engine stop failed during rollback");
            self.emit_error(TunnelError::EngineStopFailed(message));
        }
    }

    fn set_state(&self, state: TunnelState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            debug!(?prev, ?state, "tunnel state changed");
            let _ = self.events.send(TunnelEvent::StateChanged(state));
        }
    }

    /// Publish the error to observers and hand it back for the caller reply.
    fn emit_error(&self, err: TunnelError) -> TunnelError {
        let _ = self.events.send(TunnelEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
        err
    }
}
