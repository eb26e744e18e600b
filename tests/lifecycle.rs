//! Integration tests for the tunnel lifecycle coordinator.
//!
//! These tests drive the coordinator against mock collaborators (proxy
//! engine, descriptor provider, packet relay) and verify the state machine,
//! the partial-failure rollback paths, and the cross-thread completion
//! handling end to end.

use std::io::Read;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use proxytun::bridge::{BridgeParams, PacketRelay, RelayError};
use proxytun::device::{TunAcquireError, TunDevice, TunProvider};
use proxytun::engine::ProxyEngine;
use proxytun::{
    Cipher, CoordinatorOptions, ErrorKind, RateSample, TunnelConfig, TunnelCoordinator,
    TunnelError, TunnelEvent, TunnelState,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const ENGINE_PORT: u16 = 12345;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("proxytun=debug")
        .with_test_writer()
        .try_init();
}

fn valid_config() -> TunnelConfig {
    TunnelConfig {
        remote_host: "proxy.example.org".to_string(),
        remote_sni: String::new(),
        remote_port: 8443,
        username: "alice".to_string(),
        password: "hunter2".to_string(),
        cipher: Cipher::ChaCha20Poly1305,
        doh_url: String::new(),
        dot_host: String::new(),
        rate_limit: 0,
        timeout_secs: 60,
        post_quantum: false,
    }
}

#[derive(Default)]
struct MockEngine {
    fail_start: Option<String>,
    fail_stop: Option<String>,
    gate: Option<Arc<Notify>>,
    start_calls: AtomicU64,
    stop_calls: AtomicU64,
}

#[async_trait]
impl ProxyEngine for MockEngine {
    async fn start(&self, _config: &TunnelConfig) -> Result<u16, String> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match &self.fail_start {
            Some(message) => Err(message.clone()),
            None => Ok(ENGINE_PORT),
        }
    }

    async fn stop(&self) -> Result<(), String> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        match &self.fail_stop {
            Some(message) => Err(message.clone()),
            None => Ok(()),
        }
    }

    fn query_rate(&self) -> RateSample {
        RateSample {
            connections: 2,
            rx_rate: 4096,
            tx_rate: 1024,
        }
    }
}

/// Hands out one end of a socket pair so tests can observe descriptor
/// closure from the peer end.
#[derive(Default)]
struct MockProvider {
    deny: bool,
    acquired: AtomicU64,
    peer: Mutex<Option<UnixStream>>,
}

#[async_trait]
impl TunProvider for MockProvider {
    async fn acquire(
        &self,
        _session_name: &str,
        _local_port: u16,
    ) -> Result<TunDevice, TunAcquireError> {
        if self.deny {
            return Err(TunAcquireError::Denied {
                reason: Some("user declined".to_string()),
            });
        }
        let (device_end, peer_end) =
            UnixStream::pair().map_err(|e| TunAcquireError::Unavailable {
                reason: e.to_string(),
            })?;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        *self.peer.lock().unwrap() = Some(peer_end);
        Ok(TunDevice::new(OwnedFd::from(device_end)))
    }
}

#[derive(Default)]
struct MockRelay {
    fail_code: Option<i32>,
    die: Arc<AtomicBool>,
    runs: AtomicU64,
    clean_shutdowns: AtomicU64,
}

impl PacketRelay for MockRelay {
    fn run(
        &self,
        _device: TunDevice,
        _local_port: u16,
        _params: &BridgeParams,
        shutdown: &CancellationToken,
    ) -> Result<(), RelayError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = self.fail_code {
            return Err(RelayError::new(code, "simulated relay failure"));
        }
        loop {
            if shutdown.is_cancelled() {
                self.clean_shutdowns.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            if self.die.load(Ordering::SeqCst) {
                return Err(RelayError::new(7, "device torn down externally"));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

struct Harness {
    engine: Arc<MockEngine>,
    provider: Arc<MockProvider>,
    relay: Arc<MockRelay>,
    coordinator: TunnelCoordinator,
}

impl Harness {
    fn new(engine: MockEngine, provider: MockProvider, relay: MockRelay) -> Self {
        Self::with_options(engine, provider, relay, CoordinatorOptions::default())
    }

    fn with_options(
        engine: MockEngine,
        provider: MockProvider,
        relay: MockRelay,
        options: CoordinatorOptions,
    ) -> Self {
        init_tracing();
        let engine = Arc::new(engine);
        let provider = Arc::new(provider);
        let relay = Arc::new(relay);
        let coordinator = TunnelCoordinator::spawn(
            engine.clone(),
            provider.clone(),
            relay.clone(),
            options,
        );
        Harness {
            engine,
            provider,
            relay,
            coordinator,
        }
    }

    /// The peer end of the most recently acquired descriptor.
    fn take_peer(&self) -> UnixStream {
        self.provider
            .peer
            .lock()
            .unwrap()
            .take()
            .expect("no descriptor was acquired")
    }
}

/// True once the other end of the socket pair has been closed.
fn descriptor_closed(peer: &UnixStream) -> bool {
    peer.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 1];
    match (&*peer).read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    }
}

async fn wait_for_state(mut rx: watch::Receiver<TunnelState>, want: TunnelState) {
    timeout(TEST_TIMEOUT, async {
        while *rx.borrow_and_update() != want {
            rx.changed().await.expect("coordinator gone");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
}

fn drain_states(rx: &mut tokio::sync::broadcast::Receiver<TunnelEvent>) -> Vec<TunnelState> {
    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let TunnelEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    states
}

#[tokio::test]
async fn test_invalid_config_start_has_no_side_effects() {
    let harness = Harness::new(
        MockEngine::default(),
        MockProvider::default(),
        MockRelay::default(),
    );

    let mut config = valid_config();
    config.remote_host.clear();

    let result = timeout(TEST_TIMEOUT, harness.coordinator.start(config))
        .await
        .unwrap();
    assert!(matches!(result, Err(TunnelError::InvalidConfig(_))));

    assert_eq!(harness.coordinator.state(), TunnelState::Stopped);
    assert_eq!(harness.engine.start_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.provider.acquired.load(Ordering::SeqCst), 0);
    assert_eq!(harness.relay.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_success_publishes_rate_samples() {
    let harness = Harness::new(
        MockEngine::default(),
        MockProvider::default(),
        MockRelay::default(),
    );
    let mut events = harness.coordinator.subscribe();

    harness.coordinator.start(valid_config()).await.unwrap();
    assert_eq!(harness.coordinator.state(), TunnelState::Started);
    assert_eq!(harness.provider.acquired.load(Ordering::SeqCst), 1);

    // one sample per second while started, first tick immediate
    tokio::time::sleep(Duration::from_secs(3)).await;

    let mut samples = 0;
    while let Ok(event) = events.try_recv() {
        if let TunnelEvent::Rate(sample) = event {
            assert_eq!(sample.connections, 2);
            samples += 1;
        }
    }
    assert!(samples >= 3, "expected at least 3 samples, got {samples}");
    assert!(harness.coordinator.last_sample().is_some());

    harness.coordinator.stop().await.unwrap();
    assert_eq!(harness.coordinator.state(), TunnelState::Stopped);
    assert!(harness.coordinator.last_sample().is_none());
}

#[tokio::test]
async fn test_engine_start_failure_rolls_back() {
    let harness = Harness::new(
        MockEngine {
            fail_start: Some("handshake refused".to_string()),
            ..Default::default()
        },
        MockProvider::default(),
        MockRelay::default(),
    );

    let result = timeout(TEST_TIMEOUT, harness.coordinator.start(valid_config()))
        .await
        .unwrap();
    assert!(matches!(result, Err(TunnelError::EngineStartFailed(m)) if m == "handshake refused"));

    assert_eq!(harness.coordinator.state(), TunnelState::Stopped);
    // no descriptor was requested and there was nothing to stop
    assert_eq!(harness.provider.acquired.load(Ordering::SeqCst), 0);
    assert_eq!(harness.engine.stop_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_engine_stop_failure_still_lands_stopped() {
    let harness = Harness::new(
        MockEngine {
            fail_stop: Some("engine wedged".to_string()),
            ..Default::default()
        },
        MockProvider::default(),
        MockRelay::default(),
    );
    let mut events = harness.coordinator.subscribe();

    harness.coordinator.start(valid_config()).await.unwrap();
    let peer = harness.take_peer();

    let result = timeout(TEST_TIMEOUT, harness.coordinator.stop())
        .await
        .unwrap();
    assert!(matches!(result, Err(TunnelError::EngineStopFailed(m)) if m == "engine wedged"));

    // the failure is surfaced, but the coordinator does not get stuck
    assert_eq!(harness.coordinator.state(), TunnelState::Stopped);
    assert_eq!(harness.engine.stop_calls.load(Ordering::SeqCst), 1);
    assert!(descriptor_closed(&peer));

    let mut saw_stop_failure = false;
    while let Ok(event) = events.try_recv() {
        if let TunnelEvent::Error { kind, .. } = event {
            assert_eq!(kind, ErrorKind::EngineStopFailed);
            saw_stop_failure = true;
        }
    }
    assert!(saw_stop_failure, "expected an EngineStopFailed event");

    // a fresh session can still be started afterwards
    harness.coordinator.start(valid_config()).await.unwrap();
    assert_eq!(harness.coordinator.state(), TunnelState::Started);
    assert_eq!(harness.provider.acquired.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_descriptor_denial_stops_engine_exactly_once() {
    let harness = Harness::new(
        MockEngine::default(),
        MockProvider {
            deny: true,
            ..Default::default()
        },
        MockRelay::default(),
    );

    let result = timeout(TEST_TIMEOUT, harness.coordinator.start(valid_config()))
        .await
        .unwrap();
    assert!(matches!(result, Err(TunnelError::TunnelDenied(Some(_)))));

    assert_eq!(harness.coordinator.state(), TunnelState::Stopped);
    assert_eq!(harness.engine.stop_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.relay.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_bridge_rejection_closes_descriptor_and_stops_engine() {
    let options = CoordinatorOptions {
        bridge: BridgeParams {
            mtu: 100, // below the relay minimum
            ..Default::default()
        },
        ..Default::default()
    };
    let harness = Harness::with_options(
        MockEngine::default(),
        MockProvider::default(),
        MockRelay::default(),
        options,
    );

    let result = timeout(TEST_TIMEOUT, harness.coordinator.start(valid_config()))
        .await
        .unwrap();
    assert!(matches!(result, Err(TunnelError::BridgeInitFailed(_))));

    assert_eq!(harness.coordinator.state(), TunnelState::Stopped);
    assert_eq!(harness.engine.stop_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.relay.runs.load(Ordering::SeqCst), 0);
    assert!(descriptor_closed(&harness.take_peer()));
}

#[tokio::test]
async fn test_stop_from_started_tears_down_in_order() {
    let harness = Harness::new(
        MockEngine::default(),
        MockProvider::default(),
        MockRelay::default(),
    );
    let mut events = harness.coordinator.subscribe();

    timeout(TEST_TIMEOUT, harness.coordinator.start(valid_config()))
        .await
        .unwrap()
        .unwrap();
    let peer = harness.take_peer();

    timeout(TEST_TIMEOUT, harness.coordinator.stop())
        .await
        .unwrap()
        .unwrap();

    // worker saw the shutdown token, descriptor is closed, engine stopped
    assert_eq!(harness.relay.clean_shutdowns.load(Ordering::SeqCst), 1);
    assert!(descriptor_closed(&peer));
    assert_eq!(harness.engine.stop_calls.load(Ordering::SeqCst), 1);

    assert_eq!(
        drain_states(&mut events),
        vec![
            TunnelState::Starting,
            TunnelState::Started,
            TunnelState::Stopping,
            TunnelState::Stopped,
        ]
    );
}

#[tokio::test]
async fn test_commands_in_wrong_state_have_no_side_effects() {
    let harness = Harness::new(
        MockEngine::default(),
        MockProvider::default(),
        MockRelay::default(),
    );

    let result = timeout(TEST_TIMEOUT, harness.coordinator.stop())
        .await
        .unwrap();
    assert!(matches!(result, Err(TunnelError::NotRunning)));

    timeout(TEST_TIMEOUT, harness.coordinator.start(valid_config()))
        .await
        .unwrap()
        .unwrap();
    let result = timeout(TEST_TIMEOUT, harness.coordinator.start(valid_config()))
        .await
        .unwrap();
    assert!(matches!(result, Err(TunnelError::AlreadyRunning)));
    assert_eq!(harness.engine.start_calls.load(Ordering::SeqCst), 1);

    harness.coordinator.stop().await.unwrap();
}

#[tokio::test]
async fn test_unexpected_bridge_exit_is_an_implicit_stop() {
    let die = Arc::new(AtomicBool::new(false));
    let harness = Harness::new(
        MockEngine::default(),
        MockProvider::default(),
        MockRelay {
            die: die.clone(),
            ..Default::default()
        },
    );
    let mut events = harness.coordinator.subscribe();

    timeout(TEST_TIMEOUT, harness.coordinator.start(valid_config()))
        .await
        .unwrap()
        .unwrap();
    let state_rx = harness.coordinator.watch_state();

    // kill the worker loop out from under the coordinator
    die.store(true, Ordering::SeqCst);
    wait_for_state(state_rx, TunnelState::Stopped).await;

    // engine was stopped without an external Stop call
    assert_eq!(harness.engine.stop_calls.load(Ordering::SeqCst), 1);

    let mut closures = 0;
    while let Ok(event) = events.try_recv() {
        if let TunnelEvent::Error { kind, .. } = event {
            if kind == ErrorKind::UnexpectedTunnelClosure {
                closures += 1;
            }
        }
    }
    assert_eq!(closures, 1, "expected exactly one closure event");

    // a follow-up Stop finds nothing to do
    let result = timeout(TEST_TIMEOUT, harness.coordinator.stop())
        .await
        .unwrap();
    assert!(matches!(result, Err(TunnelError::NotRunning)));
}

#[tokio::test]
async fn test_stop_during_starting_resolves_to_stopped() {
    let gate = Arc::new(Notify::new());
    let harness = Harness::new(
        MockEngine {
            gate: Some(gate.clone()),
            ..Default::default()
        },
        MockProvider::default(),
        MockRelay::default(),
    );

    let starter = harness.coordinator.clone();
    let start_task = tokio::spawn(async move { starter.start(valid_config()).await });

    // let the start command reach the engine and park on the gate
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.coordinator.state(), TunnelState::Starting);

    let stopper = harness.coordinator.clone();
    let stop_task = tokio::spawn(async move { stopper.stop().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // the queued stop must not race the in-flight start
    gate.notify_one();

    let start_result = timeout(TEST_TIMEOUT, start_task).await.unwrap().unwrap();
    let stop_result = timeout(TEST_TIMEOUT, stop_task).await.unwrap().unwrap();
    assert!(start_result.is_ok());
    assert!(stop_result.is_ok());

    assert_eq!(harness.coordinator.state(), TunnelState::Stopped);
    assert_eq!(harness.engine.stop_calls.load(Ordering::SeqCst), 1);
    // the bridge that the start launched was cleanly quiesced, not orphaned
    assert_eq!(harness.relay.clean_shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_tears_down_running_session() {
    let harness = Harness::new(
        MockEngine::default(),
        MockProvider::default(),
        MockRelay::default(),
    );

    timeout(TEST_TIMEOUT, harness.coordinator.start(valid_config()))
        .await
        .unwrap()
        .unwrap();
    let peer = harness.take_peer();

    timeout(TEST_TIMEOUT, harness.coordinator.shutdown())
        .await
        .unwrap();

    assert_eq!(harness.engine.stop_calls.load(Ordering::SeqCst), 1);
    assert!(descriptor_closed(&peer));
    assert_eq!(harness.coordinator.state(), TunnelState::Stopped);

    // the actor is gone; further commands report Closed
    let result = timeout(TEST_TIMEOUT, harness.coordinator.start(valid_config()))
        .await
        .unwrap();
    assert!(matches!(result, Err(TunnelError::Closed)));
}

#[tokio::test]
async fn test_state_trace_cycles_cleanly() {
    let harness = Harness::new(
        MockEngine::default(),
        MockProvider::default(),
        MockRelay::default(),
    );
    let mut events = harness.coordinator.subscribe();

    for _ in 0..2 {
        timeout(TEST_TIMEOUT, harness.coordinator.start(valid_config()))
            .await
            .unwrap()
            .unwrap();
        timeout(TEST_TIMEOUT, harness.coordinator.stop())
            .await
            .unwrap()
            .unwrap();
    }

    let cycle = [
        TunnelState::Starting,
        TunnelState::Started,
        TunnelState::Stopping,
        TunnelState::Stopped,
    ];
    let mut expected = Vec::new();
    expected.extend_from_slice(&cycle);
    expected.extend_from_slice(&cycle);
    assert_eq!(drain_states(&mut events), expected);
}
