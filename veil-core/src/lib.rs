#![forbid(unsafe_code)]

//! Veil core utilities: configuration, error types, and tunnel addressing.
//!
//! Everything here is transport- and crypto-agnostic; the other crates layer
//! the session machinery and packet pipeline on top.

pub mod config;
pub mod error;
pub mod ip;

pub use config::{
    ClientConfig, ConnectionSettings, Mode, Protocol, RekeyPolicy, ServerConfig, TransportSettings,
    TunnelConfig,
};
pub use error::{Error, Result};
