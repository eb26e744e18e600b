//! Stats poller.
//!
//! While the tunnel is started, a dedicated task pulls one throughput sample
//! per second from the proxy engine and republishes it to observers. While
//! the tunnel is not started the poller holds no resources at all.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::engine::ProxyEngine;
use crate::types::{RateSample, TunnelEvent};

const POLL_PERIOD: Duration = Duration::from_secs(1);

/// Periodic 1 Hz rate sampler over the proxy engine.
///
/// Sampling runs entirely on the poller's own task; it never touches the
/// coordinator's command loop.
pub struct StatsPoller {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl StatsPoller {
    /// Start the periodic timer. The first sample is taken immediately.
    pub fn arm(
        engine: Arc<dyn ProxyEngine>,
        events: broadcast::Sender<TunnelEvent>,
        sample_tx: watch::Sender<Option<RateSample>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_PERIOD);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let sample = engine.query_rate();
                        trace!(
                            connections = sample.connections,
                            rx_rate = sample.rx_rate,
                            tx_rate = sample.tx_rate,
                            "rate sample"
                        );
                        sample_tx.send_replace(Some(sample));
                        let _ = events.send(TunnelEvent::Rate(sample));
                    }
                }
            }
        });

        StatsPoller {
            cancel,
            task: Some(task),
        }
    }

    /// Stop the timer. No sample is published after this returns: the poller
    /// task is cancelled and joined before the call completes.
    pub async fn disarm(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for StatsPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
