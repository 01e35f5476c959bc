//! Server-side client session registry.
//!
//! Two indices over the same entry: tunnel-internal IP (used by the
//! device→transport router) and transport endpoint (used by the datagram
//! receive loop). Registration is refused when the internal IP is already
//! taken; the offending connection is the caller's to close. A sweeper task
//! evicts entries that have been idle past the session TTL.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{Error, Result};

/// One registered client session. Crypto state is not stored here; it lives
/// with the per-peer tasks, which the `cancel` token tears down.
pub struct PeerEntry {
    pub internal_ip: IpAddr,
    pub remote_addr: SocketAddr,
    /// Plaintext packets bound for this peer; the per-peer writer task seals
    /// and frames them.
    pub outbound: mpsc::Sender<Vec<u8>>,
    pub cancel: CancellationToken,
    last_seen_ms: AtomicU64,
}

impl PeerEntry {
    pub fn new(
        internal_ip: IpAddr,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            internal_ip,
            remote_addr,
            outbound,
            cancel,
            last_seen_ms: AtomicU64::new(0),
        })
    }
}

pub struct SessionRegistry {
    by_ip: DashMap<IpAddr, Arc<PeerEntry>>,
    by_addr: DashMap<SocketAddr, Arc<PeerEntry>>,
    started: Instant,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            by_ip: DashMap::new(),
            by_addr: DashMap::new(),
            started: Instant::now(),
        })
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Insert both indices. An existing entry under the same internal IP is
    /// a collision and the new session is refused.
    pub fn store(&self, entry: Arc<PeerEntry>) -> Result<()> {
        entry.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);
        match self.by_ip.entry(entry.internal_ip) {
            Entry::Occupied(_) => return Err(Error::IpCollision(entry.internal_ip)),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }
        self.by_addr.insert(entry.remote_addr, entry.clone());
        info!(ip = %entry.internal_ip, remote = %entry.remote_addr, "client session registered");
        Ok(())
    }

    pub fn by_ip(&self, ip: IpAddr) -> Option<Arc<PeerEntry>> {
        self.by_ip.get(&ip).map(|e| e.value().clone())
    }

    pub fn by_addr(&self, addr: SocketAddr) -> Option<Arc<PeerEntry>> {
        self.by_addr.get(&addr).map(|e| e.value().clone())
    }

    /// Refresh the idle clock for an entry.
    pub fn touch(&self, entry: &PeerEntry) {
        entry.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Remove both indices for the entry resolved by either key.
    pub fn remove(&self, entry: &PeerEntry) {
        self.by_ip.remove(&entry.internal_ip);
        self.by_addr.remove(&entry.remote_addr);
        debug!(ip = %entry.internal_ip, "client session removed");
    }

    pub fn len(&self) -> usize {
        self.by_ip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ip.is_empty()
    }

    /// Drop and cancel every entry idle longer than `ttl`. Returns how many
    /// sessions were evicted.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let cutoff = self.now_ms().saturating_sub(ttl.as_millis() as u64);
        let stale: Vec<Arc<PeerEntry>> = self
            .by_ip
            .iter()
            .filter(|e| e.last_seen_ms.load(Ordering::Relaxed) < cutoff)
            .map(|e| e.value().clone())
            .collect();
        for entry in &stale {
            self.remove(entry);
            entry.cancel.cancel();
            info!(ip = %entry.internal_ip, "session evicted after ttl");
        }
        stale.len()
    }

    /// Background eviction at the configured cadence.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        ttl: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.evict_idle(ttl);
                    }
                }
            }
        })
    }
}
