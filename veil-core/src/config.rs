//! Veil configuration handling. Parses a TOML file into a strongly-typed
//! structure and validates it once at startup; the dataplane itself only ever
//! sees the immutable [`ConnectionSettings`] record derived from it.

use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ip::Cidr;

/// Transport protocol carrying the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Which dataplane this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    Server,
}

/// Per-protocol transport settings shared by client and server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Server host (name or literal address) the client dials / the server binds.
    pub server_host: String,
    pub server_port: u16,
    /// Tunnel interface name handed to the device collaborator.
    pub interface_name: String,
    pub mtu: u16,
    /// IPv4 interface subnet in CIDR notation.
    pub subnet: String,
    /// Optional IPv6 interface subnet.
    pub subnet_v6: Option<String>,
    pub dial_timeout_secs: u64,
    /// Idle seconds before a keepalive probe is sent.
    pub keepalive_send_secs: u64,
    /// Idle seconds before the connection is declared dead.
    pub keepalive_timeout_secs: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: default_port(),
            interface_name: "veil0".to_string(),
            mtu: default_mtu(),
            subnet: "10.77.0.0/24".to_string(),
            subnet_v6: None,
            dial_timeout_secs: 5,
            keepalive_send_secs: 25,
            keepalive_timeout_secs: 35,
        }
    }
}

fn default_port() -> u16 {
    48100
}

fn default_mtu() -> u16 {
    1420
}

/// Rekey cadence for datagram sessions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RekeyPolicy {
    /// Packets sent on the active epoch before a rekey is initiated.
    pub max_packets: u64,
    /// Seconds an epoch may stay active before a rekey is initiated.
    pub max_age_secs: u64,
    /// Seconds an unconfirmed rekey may stay pending before it is aborted.
    pub pending_timeout_secs: u64,
}

impl Default for RekeyPolicy {
    fn default() -> Self {
        Self {
            max_packets: 1 << 20,
            max_age_secs: 600,
            pending_timeout_secs: 30,
        }
    }
}

/// Client-side configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub protocol: Protocol,
    pub tcp: TransportSettings,
    pub udp: TransportSettings,
    /// Server identity public key, hex, consumed by the handshake collaborator.
    pub server_public_key: Option<String>,
    /// Pre-shared tunnel secret, 32 bytes hex, for the static key schedule.
    pub preshared_secret: Option<String>,
    pub rekey: RekeyPolicy,
    /// Position of this client in the subnet allocation order.
    pub client_counter: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Udp,
            tcp: TransportSettings::default(),
            udp: TransportSettings::default(),
            server_public_key: None,
            preshared_secret: None,
            rekey: RekeyPolicy::default(),
            client_counter: 1,
        }
    }
}

/// Server-side configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enable_tcp: bool,
    pub enable_udp: bool,
    pub tcp: TransportSettings,
    pub udp: TransportSettings,
    /// Address advertised to clients when the bind address is not routable.
    pub advertised_address: Option<String>,
    /// Long-term identity keys, hex, consumed by the handshake collaborator.
    pub identity_public_key: Option<String>,
    pub identity_private_key: Option<String>,
    pub preshared_secret: Option<String>,
    /// First counter handed to [`crate::ip::client_ip`] for new peers.
    pub client_counter_start: u32,
    pub session_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    pub rekey: RekeyPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enable_tcp: true,
            enable_udp: true,
            tcp: TransportSettings::default(),
            udp: TransportSettings::default(),
            advertised_address: None,
            identity_public_key: None,
            identity_private_key: None,
            preshared_secret: None,
            client_counter_start: 1,
            session_ttl_secs: 3600,
            cleanup_interval_secs: 60,
            rekey: RekeyPolicy::default(),
        }
    }
}

/// Primary configuration structure for the daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub mode: Mode,
    /// Logging verbosity (`error`, `warn`, `info`, `debug`, `trace`).
    pub log_level: Option<String>,
    /// Unix socket over which the platform integration relays tunnel
    /// packets; interface creation itself happens in that collaborator.
    pub device_socket: Option<String>,
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            log_level: Some("info".to_string()),
            device_socket: None,
            client: ClientConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl TunnelConfig {
    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(&path)?;
        let cfg = toml::from_str::<TunnelConfig>(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Cross-field validation run once after deserialization.
    pub fn validate(&self) -> Result<()> {
        for settings in [&self.client.tcp, &self.client.udp, &self.server.tcp, &self.server.udp] {
            settings.validate()?;
        }
        if let Some(secret) = &self.client.preshared_secret {
            parse_key_hex(secret)?;
        }
        if let Some(secret) = &self.server.preshared_secret {
            parse_key_hex(secret)?;
        }
        if self.server.cleanup_interval_secs == 0 {
            return Err(Error::config("cleanup_interval_secs must be non-zero"));
        }
        if self.client.client_counter == 0 {
            return Err(Error::config("client_counter starts at 1"));
        }
        Ok(())
    }
}

impl TransportSettings {
    pub fn validate(&self) -> Result<()> {
        if self.server_port == 0 {
            return Err(Error::config("server_port must be non-zero"));
        }
        if self.mtu < 576 {
            return Err(Error::config(format!("mtu {} below IPv4 minimum", self.mtu)));
        }
        self.subnet.parse::<Cidr>()?;
        if let Some(v6) = &self.subnet_v6 {
            let cidr: Cidr = v6.parse()?;
            if cidr.is_ipv4() {
                return Err(Error::config("subnet_v6 must be an IPv6 subnet"));
            }
        }
        if self.keepalive_timeout_secs <= self.keepalive_send_secs {
            return Err(Error::config(
                "keepalive_timeout_secs must exceed keepalive_send_secs",
            ));
        }
        Ok(())
    }

    pub fn subnet(&self) -> Result<Cidr> {
        self.subnet.parse()
    }

    pub fn subnet_v6(&self) -> Result<Option<Cidr>> {
        self.subnet_v6.as_deref().map(str::parse).transpose()
    }
}

/// Immutable per-connection record consumed by the dataplane.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub protocol: Protocol,
    pub server_host: String,
    pub server_port: u16,
    pub interface_name: String,
    pub mtu: u16,
    pub subnet: Cidr,
    pub subnet_v6: Option<Cidr>,
    pub dial_timeout: Duration,
    pub keepalive_send: Duration,
    pub keepalive_timeout: Duration,
    pub session_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl ConnectionSettings {
    pub fn for_client(cfg: &ClientConfig) -> Result<Self> {
        let (protocol, t) = match cfg.protocol {
            Protocol::Tcp => (Protocol::Tcp, &cfg.tcp),
            Protocol::Udp => (Protocol::Udp, &cfg.udp),
        };
        Self::from_transport(protocol, t, Duration::from_secs(3600), Duration::from_secs(60))
    }

    pub fn for_server(cfg: &ServerConfig, protocol: Protocol) -> Result<Self> {
        let t = match protocol {
            Protocol::Tcp => &cfg.tcp,
            Protocol::Udp => &cfg.udp,
        };
        Self::from_transport(
            protocol,
            t,
            Duration::from_secs(cfg.session_ttl_secs),
            Duration::from_secs(cfg.cleanup_interval_secs),
        )
    }

    fn from_transport(
        protocol: Protocol,
        t: &TransportSettings,
        session_ttl: Duration,
        cleanup_interval: Duration,
    ) -> Result<Self> {
        Ok(Self {
            protocol,
            server_host: t.server_host.clone(),
            server_port: t.server_port,
            interface_name: t.interface_name.clone(),
            mtu: t.mtu,
            subnet: t.subnet()?,
            subnet_v6: t.subnet_v6()?,
            dial_timeout: Duration::from_secs(t.dial_timeout_secs),
            keepalive_send: Duration::from_secs(t.keepalive_send_secs),
            keepalive_timeout: Duration::from_secs(t.keepalive_timeout_secs),
            session_ttl,
            cleanup_interval,
        })
    }

    /// Tunnel-internal address of the server in the configured subnet.
    pub fn server_tunnel_ip(&self) -> IpAddr {
        crate::ip::server_ip(&self.subnet)
    }
}

/// Decode a 32-byte key from hex.
pub fn parse_key_hex(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s.trim()).map_err(|e| Error::config(format!("bad key hex: {e}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::config(format!("key must be 32 bytes, got {}", bytes.len())))
}
