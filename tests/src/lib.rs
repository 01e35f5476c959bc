#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

//! Shared helpers for the end-to-end scenarios.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use veil_core::config::{ConnectionSettings, Protocol, RekeyPolicy, ServerConfig};
use veil_core::ip::Cidr;

pub const TEST_SECRET: [u8; 32] = [0x77; 32];
pub const TEST_SUBNET: &str = "10.90.0.0/24";

/// Minimal well-formed IPv4 packet: fixed header plus payload.
pub fn ipv4_packet(src: IpAddr, dst: IpAddr, payload: &[u8]) -> Vec<u8> {
    let (IpAddr::V4(src), IpAddr::V4(dst)) = (src, dst) else {
        panic!("ipv4 helper used with ipv6 addresses");
    };
    let total = 20 + payload.len();
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64; // ttl
    packet[9] = 17; // udp
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet[20..].copy_from_slice(payload);
    packet
}

pub fn subnet() -> Cidr {
    TEST_SUBNET.parse().unwrap()
}

pub fn client_tunnel_ip(counter: u32) -> IpAddr {
    veil_core::ip::client_ip(&subnet(), counter).unwrap()
}

pub fn server_tunnel_ip() -> IpAddr {
    veil_core::ip::server_ip(&subnet())
}

/// Client connection settings pointing at a bound test server.
pub fn client_settings(protocol: Protocol, server: SocketAddr) -> ConnectionSettings {
    ConnectionSettings {
        protocol,
        server_host: server.ip().to_string(),
        server_port: server.port(),
        interface_name: "veil-test".to_string(),
        mtu: 1420,
        subnet: subnet(),
        subnet_v6: None,
        dial_timeout: Duration::from_secs(2),
        keepalive_send: Duration::from_secs(5),
        keepalive_timeout: Duration::from_secs(8),
        session_ttl: Duration::from_secs(60),
        cleanup_interval: Duration::from_secs(5),
    }
}

/// Server config bound to loopback ephemeral ports, one protocol enabled.
pub fn server_config(protocol: Protocol) -> ServerConfig {
    let mut cfg = ServerConfig {
        enable_tcp: protocol == Protocol::Tcp,
        enable_udp: protocol == Protocol::Udp,
        ..ServerConfig::default()
    };
    for t in [&mut cfg.tcp, &mut cfg.udp] {
        t.server_host = "127.0.0.1".to_string();
        t.server_port = 0; // bind an ephemeral port
        t.subnet = TEST_SUBNET.to_string();
    }
    cfg
}

pub fn fast_rekey(max_packets: u64) -> RekeyPolicy {
    RekeyPolicy {
        max_packets,
        max_age_secs: 3600,
        pending_timeout_secs: 1,
    }
}
