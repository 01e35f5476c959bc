//! Server dataplane.
//!
//! One listener per enabled transport feeds per-peer sessions into a shared
//! [`SessionRegistry`]. A single router task reads the tunnel device and
//! demultiplexes by destination address; per-peer writer tasks own the send
//! crypto so record order per session is fixed by construction.
//!
//! A client whose handshake lands on an already-registered tunnel address is
//! answered with one `SessionReset` service frame and dropped.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use socket2::{Domain, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use veil_core::config::{ConnectionSettings, Protocol, RekeyPolicy, ServerConfig};
use veil_core::ip;
use veil_crypto::{
    kdf, Nonce, RekeyController, Role, SendSession, Session, DEFAULT_REPLAY_WINDOW,
};
use veil_wire::service::{self, FrameBuf, FrameKind};
use veil_wire::{encode_datagram, is_keepalive, parse_datagram, TcpFrameCodec, KEEPALIVE};

use crate::device::TunDevice;
use crate::handshake::SessionEstablisher;
use crate::registry::{PeerEntry, SessionRegistry};
use crate::Result;

const OUTBOUND_DEPTH: usize = 256;
const READ_BUF: usize = 65535;

/// Everything `start_server` spawned, plus the addresses it actually bound.
pub struct ServerHandle {
    pub tcp_addr: Option<SocketAddr>,
    pub udp_addr: Option<SocketAddr>,
    pub registry: Arc<SessionRegistry>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    /// Wait for every server task to wind down (after cancellation).
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Bind the enabled listeners and spawn the server tasks.
pub async fn start_server<D: TunDevice>(
    cfg: &ServerConfig,
    device: Arc<D>,
    establisher: Arc<dyn SessionEstablisher>,
    cancel: CancellationToken,
) -> Result<ServerHandle> {
    let registry = SessionRegistry::new();
    let mut tasks = Vec::new();

    tasks.push(registry.spawn_sweeper(
        Duration::from_secs(cfg.cleanup_interval_secs),
        Duration::from_secs(cfg.session_ttl_secs),
        cancel.clone(),
    ));
    tasks.push(tokio::spawn(route_device_packets(
        device.clone(),
        registry.clone(),
        cancel.clone(),
    )));

    let mut tcp_addr = None;
    if cfg.enable_tcp {
        let settings = ConnectionSettings::for_server(cfg, Protocol::Tcp)?;
        let listener =
            TcpListener::bind((settings.server_host.as_str(), settings.server_port)).await?;
        let bound = listener.local_addr()?;
        info!(addr = %bound, "tcp listener up");
        tcp_addr = Some(bound);
        tasks.push(tokio::spawn(tcp_accept_loop(
            listener,
            settings,
            device.clone(),
            establisher.clone(),
            registry.clone(),
            cancel.clone(),
        )));
    }

    let mut udp_addr = None;
    if cfg.enable_udp {
        let settings = ConnectionSettings::for_server(cfg, Protocol::Udp)?;
        let socket = Arc::new(bind_udp(&settings.server_host, settings.server_port)?);
        let bound = socket.local_addr()?;
        info!(addr = %bound, "udp endpoint up");
        udp_addr = Some(bound);
        tasks.push(tokio::spawn(udp_endpoint(
            socket,
            cfg.rekey.clone(),
            device.clone(),
            establisher.clone(),
            registry.clone(),
            cancel.clone(),
        )));
    }

    Ok(ServerHandle {
        tcp_addr,
        udp_addr,
        registry,
        tasks,
    })
}

/// Run the server dataplane until `cancel` fires.
pub async fn run_server<D: TunDevice>(
    cfg: &ServerConfig,
    device: Arc<D>,
    establisher: Arc<dyn SessionEstablisher>,
    cancel: CancellationToken,
) -> Result<()> {
    let handle = start_server(cfg, device, establisher, cancel.clone()).await?;
    cancel.cancelled().await;
    handle.join().await;
    Ok(())
}

/// Datagram bind with address/port reuse so restarts take over cleanly.
fn bind_udp(host: &str, port: u16) -> std::io::Result<UdpSocket> {
    let ip: IpAddr = host.parse().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let addr = SocketAddr::new(ip, port);
    let socket = socket2::Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    let std_sock: std::net::UdpSocket = socket.into();
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Single device reader: route each packet to the session owning its
/// destination address. A stalled peer costs its own queue, not the router.
async fn route_device_packets<D: TunDevice>(
    device: Arc<D>,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let len = tokio::select! {
            _ = cancel.cancelled() => break,
            read = device.recv(&mut buf) => match read {
                Ok(len) => len,
                Err(e) => {
                    error!(error = %e, "tunnel device failed, stopping server");
                    cancel.cancel();
                    break;
                }
            },
        };
        let packet = &buf[..len];
        let dst = match ip::destination(packet) {
            Ok(dst) => dst,
            Err(e) => {
                debug!(error = %e, "unroutable device packet");
                continue;
            }
        };
        match registry.by_ip(dst) {
            Some(entry) => {
                if entry.outbound.try_send(packet.to_vec()).is_err() {
                    debug!(ip = %dst, "peer queue full, dropping packet");
                }
            }
            None => debug!(ip = %dst, "no session for destination"),
        }
    }
}

async fn tcp_accept_loop<D: TunDevice>(
    listener: TcpListener,
    settings: ConnectionSettings,
    device: Arc<D>,
    establisher: Arc<dyn SessionEstablisher>,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, remote) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        debug!(%remote, "inbound tcp connection");
        tokio::spawn(serve_tcp_peer(
            stream,
            remote,
            settings.dial_timeout,
            device.clone(),
            establisher.clone(),
            registry.clone(),
            cancel.clone(),
        ));
    }
}

async fn serve_tcp_peer<D: TunDevice>(
    stream: TcpStream,
    remote: SocketAddr,
    handshake_timeout: Duration,
    device: Arc<D>,
    establisher: Arc<dyn SessionEstablisher>,
    registry: Arc<SessionRegistry>,
    server_cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "nodelay not set");
    }
    let outcome = match tokio::time::timeout(
        handshake_timeout,
        establisher.establish_server(remote),
    )
    .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            warn!(%remote, error = %e, "handshake failed");
            return;
        }
        Err(_) => {
            warn!(%remote, "handshake timed out");
            return;
        }
    };

    let session = Session::new(
        outcome.material.for_role(Role::Server),
        outcome.session_id,
        Role::Server,
    );
    let (mut send, mut recv) = session.split();
    let (read_half, write_half) = stream.into_split();
    let mut framed_read = FramedRead::new(read_half, TcpFrameCodec::new());
    let mut framed_write = FramedWrite::new(write_half, TcpFrameCodec::new());

    let conn = server_cancel.child_token();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_DEPTH);
    let entry = PeerEntry::new(outcome.internal_ip, remote, outbound_tx, conn.clone());

    if let Err(e) = registry.store(entry.clone()) {
        warn!(%remote, error = %e, "rejecting colliding session");
        send_reset(&mut send, &mut framed_write).await;
        return;
    }

    let writer = tokio::spawn(tcp_peer_writer(framed_write, send, outbound_rx, conn.clone()));

    // reader: this task
    loop {
        let record = tokio::select! {
            _ = conn.cancelled() => break,
            item = framed_read.next() => match item {
                None => {
                    debug!(%remote, "peer closed the stream");
                    break;
                }
                Some(Err(e)) => {
                    warn!(%remote, error = %e, "transport read failed");
                    break;
                }
                Some(Ok(record)) => record,
            },
        };
        match recv.open_next(&record) {
            Ok(plain) => {
                registry.touch(&entry);
                handle_peer_plaintext(
                    &plain,
                    &device,
                    &entry,
                    &registry,
                    PeerCrypto::Stream,
                    &server_cancel,
                )
                .await;
            }
            Err(e) => {
                warn!(%remote, error = %e, "record failed authentication, dropping peer");
                break;
            }
        }
    }
    conn.cancel();
    registry.remove(&entry);
    let _ = writer.await;
}

/// Seal and emit one `SessionReset`, ignoring failures — the peer is being
/// dropped either way.
async fn send_reset(
    send: &mut SendSession,
    framed: &mut FramedWrite<tokio::net::tcp::OwnedWriteHalf, TcpFrameCodec>,
) {
    let mut framebuf = FrameBuf::new();
    if let Ok(frame) = framebuf.marshal(FrameKind::SessionReset, 0, b"") {
        if let Ok(sealed) = send.seal(frame) {
            let _ = framed.send(Bytes::from(sealed.ciphertext)).await;
        }
    }
}

async fn tcp_peer_writer(
    mut framed: FramedWrite<tokio::net::tcp::OwnedWriteHalf, TcpFrameCodec>,
    mut send: SendSession,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    conn: CancellationToken,
) {
    loop {
        let plain = tokio::select! {
            _ = conn.cancelled() => break,
            item = outbound.recv() => match item {
                None => break,
                Some(plain) => plain,
            },
        };
        match send.seal(&plain) {
            Ok(sealed) => {
                if let Err(e) = framed.send(Bytes::from(sealed.ciphertext)).await {
                    warn!(error = %e, "transport write failed");
                    conn.cancel();
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "send session unusable");
                conn.cancel();
                break;
            }
        }
    }
}

/// Per-peer state for the datagram transport.
struct UdpPeer {
    controller: Arc<Mutex<RekeyController>>,
    base_secret: [u8; 32],
    entry: Arc<PeerEntry>,
}

async fn udp_endpoint<D: TunDevice>(
    socket: Arc<UdpSocket>,
    rekey: RekeyPolicy,
    device: Arc<D>,
    establisher: Arc<dyn SessionEstablisher>,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
) {
    let peers: Arc<DashMap<SocketAddr, Arc<UdpPeer>>> = Arc::new(DashMap::new());
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let (len, addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    // datagram sockets surface transient errors; keep serving
                    warn!(error = %e, "datagram receive failed");
                    continue;
                }
            },
        };
        let view = match parse_datagram(&buf[..len]) {
            Ok(view) => view,
            Err(e) => {
                debug!(%addr, error = %e, "dropping malformed datagram");
                continue;
            }
        };
        let nonce = Nonce::from_bytes(&view.nonce);

        if let Some(peer) = peers.get(&addr).map(|p| p.value().clone()) {
            let opened = {
                let mut ctrl = peer.controller.lock().await;
                ctrl.decrypt(view.epoch_tag, nonce, view.ciphertext)
            };
            match opened {
                Ok(plain) => {
                    registry.touch(&peer.entry);
                    handle_peer_plaintext(
                        &plain,
                        &device,
                        &peer.entry,
                        &registry,
                        PeerCrypto::Datagram {
                            controller: &peer.controller,
                            base_secret: &peer.base_secret,
                        },
                        &cancel,
                    )
                    .await;
                }
                Err(e) => debug!(%addr, error = %e, "dropping datagram"),
            }
            continue;
        }

        // unknown endpoint: run the establishment and require the very first
        // datagram to authenticate before anything is registered
        let outcome = match establisher.establish_server(addr).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%addr, error = %e, "handshake failed");
                continue;
            }
        };
        let mut controller = RekeyController::new(
            outcome.material.for_role(Role::Server),
            outcome.session_id,
            Role::Server,
            Duration::from_secs(rekey.pending_timeout_secs),
            DEFAULT_REPLAY_WINDOW,
        );
        let plain = match controller.decrypt(view.epoch_tag, nonce, view.ciphertext) {
            Ok(plain) => plain,
            Err(e) => {
                debug!(%addr, error = %e, "first datagram failed authentication");
                continue;
            }
        };

        let conn = cancel.child_token();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_DEPTH);
        let entry = PeerEntry::new(outcome.internal_ip, addr, outbound_tx, conn.clone());
        let controller = Arc::new(Mutex::new(controller));

        if let Err(e) = registry.store(entry.clone()) {
            warn!(%addr, error = %e, "rejecting colliding session");
            send_reset_datagram(&socket, addr, &controller).await;
            continue;
        }
        info!(%addr, ip = %outcome.internal_ip, "udp peer established");

        let peer = Arc::new(UdpPeer {
            controller: controller.clone(),
            base_secret: outcome.base_secret,
            entry: entry.clone(),
        });
        peers.insert(addr, peer.clone());
        tokio::spawn(udp_peer_writer(
            socket.clone(),
            addr,
            controller,
            outbound_rx,
            conn.clone(),
        ));
        // forget the endpoint once the session is torn down, however that happened
        {
            let peers = peers.clone();
            let registry = registry.clone();
            let entry = entry.clone();
            tokio::spawn(async move {
                conn.cancelled().await;
                peers.remove(&entry.remote_addr);
                registry.remove(&entry);
            });
        }

        registry.touch(&peer.entry);
        handle_peer_plaintext(
            &plain,
            &device,
            &peer.entry,
            &registry,
            PeerCrypto::Datagram {
                controller: &peer.controller,
                base_secret: &peer.base_secret,
            },
            &cancel,
        )
        .await;
    }
}

async fn send_reset_datagram(
    socket: &UdpSocket,
    addr: SocketAddr,
    controller: &Arc<Mutex<RekeyController>>,
) {
    let mut framebuf = FrameBuf::new();
    let sealed = {
        let mut ctrl = controller.lock().await;
        match framebuf.marshal(FrameKind::SessionReset, 0, b"") {
            Ok(frame) => ctrl.encrypt(frame).ok(),
            Err(_) => None,
        }
    };
    if let Some((epoch, packet)) = sealed {
        let mut datagram = Vec::new();
        encode_datagram(
            (epoch & 0xff) as u8,
            &packet.nonce.to_bytes(),
            &packet.ciphertext,
            &mut datagram,
        );
        let _ = socket.send_to(&datagram, addr).await;
    }
}

async fn udp_peer_writer(
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    controller: Arc<Mutex<RekeyController>>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    conn: CancellationToken,
) {
    let mut datagram = Vec::with_capacity(READ_BUF);
    loop {
        let plain = tokio::select! {
            _ = conn.cancelled() => break,
            item = outbound.recv() => match item {
                None => break,
                Some(plain) => plain,
            },
        };
        let sealed = {
            let mut ctrl = controller.lock().await;
            ctrl.encrypt(&plain)
        };
        match sealed {
            Ok((epoch, packet)) => {
                encode_datagram(
                    (epoch & 0xff) as u8,
                    &packet.nonce.to_bytes(),
                    &packet.ciphertext,
                    &mut datagram,
                );
                if let Err(e) = socket.send_to(&datagram, addr).await {
                    warn!(%addr, error = %e, "transport write failed");
                    conn.cancel();
                    break;
                }
            }
            Err(e) => {
                error!(%addr, error = %e, "send session unusable");
                conn.cancel();
                break;
            }
        }
    }
}

enum PeerCrypto<'a> {
    Stream,
    Datagram {
        controller: &'a Arc<Mutex<RekeyController>>,
        base_secret: &'a [u8; 32],
    },
}

/// Route one decrypted payload from a peer: keepalives are echoed, service
/// frames handled, real packets source-checked and written to the device.
async fn handle_peer_plaintext<D: TunDevice>(
    plain: &[u8],
    device: &Arc<D>,
    entry: &Arc<PeerEntry>,
    registry: &Arc<SessionRegistry>,
    crypto: PeerCrypto<'_>,
    server_cancel: &CancellationToken,
) {
    if is_keepalive(plain) {
        // echo so the client's silence detector sees a live path
        let _ = entry.outbound.try_send(KEEPALIVE.to_vec());
        return;
    }
    if service::is_service_frame(plain) {
        match service::unmarshal(plain) {
            Ok(frame) => {
                handle_peer_frame(frame, entry, registry, crypto).await;
                return;
            }
            Err(e) => {
                debug!(error = %e, "malformed service frame");
                if ip::version(plain).is_err() {
                    return;
                }
            }
        }
    }
    match ip::source(plain) {
        Ok(src) if src == entry.internal_ip => {
            if let Err(e) = device.send(plain).await {
                error!(error = %e, "tunnel device failed, stopping server");
                server_cancel.cancel();
            }
        }
        Ok(src) => {
            debug!(claimed = %src, expected = %entry.internal_ip, "dropping spoofed source");
        }
        Err(e) => debug!(error = %e, "dropping unparseable packet"),
    }
}

async fn handle_peer_frame(
    frame: service::ServiceFrame<'_>,
    entry: &Arc<PeerEntry>,
    registry: &Arc<SessionRegistry>,
    crypto: PeerCrypto<'_>,
) {
    match frame.kind {
        FrameKind::SessionReset => {
            info!(ip = %entry.internal_ip, "peer reset its session");
            registry.remove(entry);
            entry.cancel.cancel();
        }
        FrameKind::MtuProbe => {
            let mut framebuf = FrameBuf::new();
            let body = service::mtu_ack_body(frame.body.len() as u16);
            if let Ok(ack) = framebuf.marshal(FrameKind::MtuAck, 0, &body) {
                let _ = entry.outbound.try_send(ack.to_vec());
            }
        }
        FrameKind::MtuAck => debug!("mtu ack from peer"),
        FrameKind::RekeyInit => match crypto {
            PeerCrypto::Datagram {
                controller,
                base_secret,
            } => {
                let (share, epoch) = match service::parse_rekey_init(frame.body) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!(error = %e, "bad rekey init");
                        return;
                    }
                };
                let keys = match kdf::derive_epoch_keys(base_secret, &share, epoch) {
                    Ok(material) => material.for_role(Role::Server),
                    Err(e) => {
                        error!(error = %e, "epoch key derivation failed");
                        return;
                    }
                };
                let installed = {
                    let mut ctrl = controller.lock().await;
                    ctrl.accept_remote(epoch, keys)
                };
                match installed {
                    Ok(epoch) => {
                        info!(epoch, ip = %entry.internal_ip, "rekey accepted");
                        let mut framebuf = FrameBuf::new();
                        let body = service::rekey_ack_body(epoch);
                        if let Ok(ack) = framebuf.marshal(FrameKind::RekeyAck, 0, &body) {
                            let _ = entry.outbound.try_send(ack.to_vec());
                        }
                    }
                    Err(e) => debug!(error = %e, "rekey init refused"),
                }
            }
            PeerCrypto::Stream => {
                debug!("in-band rekey not supported on the stream transport");
            }
        },
        FrameKind::RekeyAck => debug!("unexpected rekey ack from peer"),
    }
}
