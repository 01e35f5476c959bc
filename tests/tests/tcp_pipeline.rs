#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end scenarios over the stream transport: packet echo through both
//! devices and the tunnel-address collision rule.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use veil_core::config::Protocol;
use veil_crypto::kdf;
use veil_tunnel::{
    memory_pair, run_client, start_server, HandshakeOutcome, PresharedEstablisher,
    SessionEstablisher,
};
use veil_integration_tests::*;

async fn recv_with_timeout(
    handle: &veil_tunnel::MemoryTunHandle,
    millis: u64,
) -> Option<Vec<u8>> {
    tokio::time::timeout(Duration::from_millis(millis), handle.next_delivered())
        .await
        .ok()
        .flatten()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn packets_cross_the_tunnel_in_both_directions() {
    let cancel = CancellationToken::new();
    let (server_device, server_handle) = memory_pair(256);
    let server_establisher = Arc::new(PresharedEstablisher::new(TEST_SECRET, subnet(), 1));

    let server = start_server(
        &server_config(Protocol::Tcp),
        server_device,
        server_establisher,
        cancel.clone(),
    )
    .await
    .unwrap();
    let server_addr = server.tcp_addr.unwrap();

    let (client_device, client_handle) = memory_pair(256);
    let client_establisher = Arc::new(PresharedEstablisher::new(TEST_SECRET, subnet(), 1));
    let client_cancel = cancel.clone();
    let client = tokio::spawn(run_client(
        client_settings(Protocol::Tcp, server_addr),
        fast_rekey(u64::MAX),
        client_device,
        client_establisher,
        client_cancel,
    ));

    // client -> server
    let up = ipv4_packet(client_tunnel_ip(1), server_tunnel_ip(), b"hello");
    client_handle.inject(&up).await.unwrap();
    let delivered = recv_with_timeout(&server_handle, 3000)
        .await
        .expect("uplink packet should reach the server device");
    assert_eq!(delivered, up);
    assert_eq!(server.registry.len(), 1);

    // server -> client
    let down = ipv4_packet(server_tunnel_ip(), client_tunnel_ip(1), b"welcome back");
    server_handle.inject(&down).await.unwrap();
    let delivered = recv_with_timeout(&client_handle, 3000)
        .await
        .expect("downlink packet should reach the client device");
    assert_eq!(delivered, down);

    cancel.cancel();
    let _ = client.await;
    server.join().await;
}

/// Establisher that hands every caller the same tunnel address, forcing the
/// registry's collision rule.
struct FixedAddressEstablisher;

#[async_trait]
impl SessionEstablisher for FixedAddressEstablisher {
    async fn establish_client(&self) -> veil_tunnel::Result<HandshakeOutcome> {
        self.establish_server("0.0.0.0:0".parse().unwrap()).await
    }

    async fn establish_server(&self, _remote: SocketAddr) -> veil_tunnel::Result<HandshakeOutcome> {
        let ip = client_tunnel_ip(1);
        let salt = b"fixed".to_vec();
        Ok(HandshakeOutcome {
            material: kdf::derive_direction_keys(&TEST_SECRET, &salt).unwrap(),
            session_id: kdf::derive_session_id(&TEST_SECRET, b"fixed", &salt).unwrap(),
            internal_ip: ip,
            base_secret: TEST_SECRET,
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_session_on_same_address_is_rejected() {
    let cancel = CancellationToken::new();
    let (server_device, server_handle) = memory_pair(256);
    let establisher = Arc::new(FixedAddressEstablisher);

    let server = start_server(
        &server_config(Protocol::Tcp),
        server_device,
        establisher.clone(),
        cancel.clone(),
    )
    .await
    .unwrap();
    let server_addr = server.tcp_addr.unwrap();

    let (first_device, first_handle) = memory_pair(256);
    let first = tokio::spawn(run_client(
        client_settings(Protocol::Tcp, server_addr),
        fast_rekey(u64::MAX),
        first_device,
        establisher.clone(),
        cancel.clone(),
    ));

    // wait until the first session is up
    let up = ipv4_packet(client_tunnel_ip(1), server_tunnel_ip(), b"first");
    first_handle.inject(&up).await.unwrap();
    assert!(recv_with_timeout(&server_handle, 3000).await.is_some());
    assert_eq!(server.registry.len(), 1);

    // the second client claims the same tunnel address and must be refused
    let (second_device, _second_handle) = memory_pair(256);
    let second = tokio::spawn(run_client(
        client_settings(Protocol::Tcp, server_addr),
        fast_rekey(u64::MAX),
        second_device,
        establisher.clone(),
        cancel.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(server.registry.len(), 1, "collision must not replace the session");

    // the surviving session still carries traffic
    let up = ipv4_packet(client_tunnel_ip(1), server_tunnel_ip(), b"still here");
    first_handle.inject(&up).await.unwrap();
    assert!(recv_with_timeout(&server_handle, 3000).await.is_some());

    cancel.cancel();
    let _ = first.await;
    let _ = second.await;
    server.join().await;
}
