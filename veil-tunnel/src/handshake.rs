//! Session establishment seam.
//!
//! The key exchange wire protocol lives outside this crate; the pipeline only
//! consumes its *result*: traffic key material, the derived session id, the
//! peer's tunnel address and a base secret for later epoch derivations.
//! [`SessionEstablisher`] is that seam. A Noise-style implementor would run
//! its round trips against the transport before the workers start; the
//! [`PresharedEstablisher`] shipped here derives everything deterministically
//! from a configured secret and needs no wire exchange at all.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};

use veil_core::ip::{client_ip, Cidr};
use veil_crypto::kdf;
use veil_crypto::KeyMaterial;

use crate::{Error, Result};

/// Everything the dataplane needs from a completed establishment.
pub struct HandshakeOutcome {
    /// Traffic keys for epoch 0, oriented by wire direction.
    pub material: KeyMaterial,
    /// 32-byte id bound into every record's associated data.
    pub session_id: [u8; 32],
    /// The client's address inside the tunnel subnet.
    pub internal_ip: IpAddr,
    /// Long-lived secret the epoch key schedule draws from on rekeys.
    pub base_secret: [u8; 32],
}

#[async_trait]
pub trait SessionEstablisher: Send + Sync + 'static {
    /// Client side: material for a fresh connection to the server.
    async fn establish_client(&self) -> Result<HandshakeOutcome>;

    /// Server side: material for a newly accepted peer.
    async fn establish_server(&self, remote: SocketAddr) -> Result<HandshakeOutcome>;
}

/// Static key schedule: both ends hold the same 32-byte secret and derive
/// per-client sessions from it, keyed by the client's tunnel address. The
/// server allocates addresses in accept order; clients are configured with
/// their position so both sides converge without a wire exchange.
pub struct PresharedEstablisher {
    secret: [u8; 32],
    subnet: Cidr,
    /// Client role: this client's fixed position. Server role: next position.
    counter: AtomicU32,
}

impl PresharedEstablisher {
    pub fn new(secret: [u8; 32], subnet: Cidr, first_counter: u32) -> Self {
        Self {
            secret,
            subnet,
            counter: AtomicU32::new(first_counter.max(1)),
        }
    }

    fn outcome_for(&self, internal_ip: IpAddr) -> Result<HandshakeOutcome> {
        let ip_bytes = match internal_ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        let session_id = kdf::derive_session_id(&self.secret, b"veil-static", &ip_bytes)?;
        let material = kdf::derive_direction_keys(&self.secret, &ip_bytes)?;
        Ok(HandshakeOutcome {
            material,
            session_id,
            internal_ip,
            base_secret: self.secret,
        })
    }
}

#[async_trait]
impl SessionEstablisher for PresharedEstablisher {
    async fn establish_client(&self) -> Result<HandshakeOutcome> {
        let counter = self.counter.load(Ordering::Relaxed);
        let ip = client_ip(&self.subnet, counter)?;
        self.outcome_for(ip)
    }

    async fn establish_server(&self, remote: SocketAddr) -> Result<HandshakeOutcome> {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let ip = client_ip(&self.subnet, counter).map_err(|e| {
            Error::HandshakeFailed(format!("no address left for {remote}: {e}"))
        })?;
        self.outcome_for(ip)
    }
}
