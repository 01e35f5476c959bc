#![forbid(unsafe_code)]

//! Veil packet pipeline.
//!
//! Per established connection two loops run concurrently: device→transport
//! (read an IP packet, seal it, frame it, hand it to the single writer) and
//! transport→device (deframe, open, intercept control traffic, write the
//! plaintext to the device). A keepalive prober watches for silence and a
//! cancellation token threads through every task so shutdown, keepalive
//! expiry and fatal transport errors all converge on the same teardown path.
//!
//! The server additionally keeps a registry of client sessions indexed by
//! tunnel-internal IP and by transport endpoint, and demultiplexes device
//! reads through it.

pub mod client;
pub mod device;
pub mod handshake;
pub mod keepalive;
pub mod registry;
pub mod server;

pub use client::{run_client, ClientState};
pub use device::{memory_pair, MemoryTun, MemoryTunHandle, TunDevice};
pub use handshake::{HandshakeOutcome, PresharedEstablisher, SessionEstablisher};
pub use keepalive::{spawn_prober, Activity, KeepaliveParams};
pub use registry::{PeerEntry, SessionRegistry};
pub use server::{run_server, start_server, ServerHandle};

use std::net::IpAddr;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Core(#[from] veil_core::Error),
    #[error(transparent)]
    Crypto(#[from] veil_crypto::Error),
    #[error(transparent)]
    Wire(#[from] veil_wire::Error),
    #[error("tunnel address {0} is already registered")]
    IpCollision(IpAddr),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("dial timed out")]
    DialTimeout,
    #[error("channel closed")]
    ChannelClosed,
}

pub type Result<T> = core::result::Result<T, Error>;
