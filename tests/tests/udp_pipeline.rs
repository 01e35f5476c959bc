#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end scenarios over the datagram transport: replay suppression,
//! rekey under continuous traffic, and keepalive-driven reconnection.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use veil_core::config::{ConnectionSettings, Protocol};
use veil_crypto::{kdf, Role, Session};
use veil_tunnel::{memory_pair, run_client, start_server, PresharedEstablisher};
use veil_wire::{encode_datagram, KEEPALIVE};
use veil_integration_tests::*;

/// Client-side session derived exactly as the static establisher does it.
fn raw_client_session() -> Session {
    let ip = client_tunnel_ip(1);
    let std::net::IpAddr::V4(v4) = ip else { panic!("test subnet is ipv4") };
    let ip_bytes = v4.octets().to_vec();
    let session_id = kdf::derive_session_id(&TEST_SECRET, b"veil-static", &ip_bytes).unwrap();
    let material = kdf::derive_direction_keys(&TEST_SECRET, &ip_bytes).unwrap();
    Session::new(material.for_role(Role::Client), session_id, Role::Client)
}

fn to_datagram(sealed: &veil_crypto::SealedPacket) -> Vec<u8> {
    let mut out = Vec::new();
    encode_datagram(0, &sealed.nonce.to_bytes(), &sealed.ciphertext, &mut out);
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_datagram_is_dropped() {
    let cancel = CancellationToken::new();
    let (server_device, server_handle) = memory_pair(256);
    let establisher = Arc::new(PresharedEstablisher::new(TEST_SECRET, subnet(), 1));

    let server = start_server(
        &server_config(Protocol::Udp),
        server_device,
        establisher,
        cancel.clone(),
    )
    .await
    .unwrap();
    let server_addr = server.udp_addr.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut session = raw_client_session();

    // announce so the endpoint registers us
    let hello = session.encrypt(KEEPALIVE).unwrap();
    socket.send_to(&to_datagram(&hello), server_addr).await.unwrap();

    // one packet, sent twice byte-for-byte
    let packet = ipv4_packet(client_tunnel_ip(1), server_tunnel_ip(), b"dgram-data");
    let sealed = session.encrypt(&packet).unwrap();
    let datagram = to_datagram(&sealed);
    socket.send_to(&datagram, server_addr).await.unwrap();
    socket.send_to(&datagram, server_addr).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(3), server_handle.next_delivered())
        .await
        .expect("first copy should be delivered")
        .unwrap();
    assert_eq!(delivered, packet);

    // the replayed copy must not reach the device
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server_handle.try_next_delivered().is_none());

    cancel.cancel();
    server.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn traffic_survives_continuous_rekeys() {
    let cancel = CancellationToken::new();
    let (server_device, server_handle) = memory_pair(512);
    let establisher = Arc::new(PresharedEstablisher::new(TEST_SECRET, subnet(), 1));

    let server = start_server(
        &server_config(Protocol::Udp),
        server_device,
        establisher.clone(),
        cancel.clone(),
    )
    .await
    .unwrap();
    let server_addr = server.udp_addr.unwrap();

    let (client_device, client_handle) = memory_pair(512);
    let client = tokio::spawn(run_client(
        client_settings(Protocol::Udp, server_addr),
        // every few packets the client must negotiate a fresh epoch
        fast_rekey(8),
        client_device,
        establisher,
        cancel.clone(),
    ));

    const PACKETS: usize = 60;
    let src = client_tunnel_ip(1);
    let dst = server_tunnel_ip();
    for i in 0..PACKETS {
        let payload = format!("packet-{i}");
        client_handle
            .inject(&ipv4_packet(src, dst, payload.as_bytes()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut received = 0;
    while received < PACKETS {
        match tokio::time::timeout(Duration::from_secs(3), server_handle.next_delivered()).await {
            Ok(Some(_)) => received += 1,
            _ => break,
        }
    }
    assert_eq!(received, PACKETS, "no packet may be lost across rekeys");

    cancel.cancel();
    let _ = client.await;
    server.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_path_triggers_reconnect() {
    // a bare socket that swallows everything: the client never hears back
    let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sink_addr = sink.local_addr().unwrap();

    let cancel = CancellationToken::new();
    let (client_device, _client_handle) = memory_pair(64);
    let establisher = Arc::new(PresharedEstablisher::new(TEST_SECRET, subnet(), 1));

    let settings = ConnectionSettings {
        keepalive_send: Duration::from_millis(100),
        keepalive_timeout: Duration::from_millis(250),
        ..client_settings(Protocol::Udp, sink_addr)
    };
    let client = tokio::spawn(run_client(
        settings,
        fast_rekey(u64::MAX),
        client_device,
        establisher,
        cancel.clone(),
    ));

    // each (re)connect announces itself from a fresh local port; observing a
    // second port proves the old workers died and the dial loop came around
    let mut ports = std::collections::HashSet::new();
    let mut buf = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
    while ports.len() < 2 && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout_at(deadline, sink.recv_from(&mut buf)).await {
            Ok(Ok((_, from))) => {
                ports.insert(from.port());
            }
            _ => break,
        }
    }
    assert!(
        ports.len() >= 2,
        "expected datagrams from at least two local ports, got {ports:?}"
    );

    cancel.cancel();
    let _ = client.await;
}
