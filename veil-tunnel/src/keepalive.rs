//! Keepalive probing and silence detection.
//!
//! One prober task per connection. The reader marks [`Activity`] whenever any
//! decrypted record arrives; the prober requests a keepalive once the link
//! has been quiet for `send_interval` and cancels the connection when the
//! silence outlives `reconnect_interval`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use veil_wire::KEEPALIVE;

/// Shared receive-activity clock.
#[derive(Clone)]
pub struct Activity {
    inner: Arc<ActivityInner>,
}

struct ActivityInner {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ActivityInner {
                started: Instant::now(),
                last_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Record that a decrypted record just arrived.
    pub fn mark(&self) {
        let elapsed = self.inner.started.elapsed().as_millis() as u64;
        self.inner.last_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last received record.
    pub fn idle(&self) -> Duration {
        let now = self.inner.started.elapsed().as_millis() as u64;
        let last = self.inner.last_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeepaliveParams {
    /// Quiet time after which a probe is sent (~25 s in production).
    pub send_interval: Duration,
    /// Quiet time after which the connection is declared dead (~35 s).
    pub reconnect_interval: Duration,
}

/// Spawn the prober. Probes are handed to the connection's control channel as
/// plaintext and travel the ordinary encrypt path; expiry cancels `conn`.
pub fn spawn_prober(
    params: KeepaliveParams,
    activity: Activity,
    probe_tx: mpsc::Sender<Vec<u8>>,
    conn: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let tick = (params.send_interval / 4).max(Duration::from_millis(10));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_probe = Instant::now();
        loop {
            tokio::select! {
                _ = conn.cancelled() => break,
                _ = interval.tick() => {
                    let idle = activity.idle();
                    if idle > params.reconnect_interval {
                        warn!(idle_ms = idle.as_millis() as u64, "peer silent past reconnect interval");
                        conn.cancel();
                        break;
                    }
                    if idle >= params.send_interval && last_probe.elapsed() >= params.send_interval {
                        debug!("sending keepalive probe");
                        if probe_tx.send(KEEPALIVE.to_vec()).await.is_err() {
                            break;
                        }
                        last_probe = Instant::now();
                    }
                }
            }
        }
    })
}
