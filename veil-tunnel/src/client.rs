//! Client dataplane.
//!
//! One connection at a time: dial, establish, then run the forwarding loops
//! until the connection dies or the parent token cancels. Transport errors
//! and keepalive expiry cancel the per-connection token; the outer loop backs
//! off and dials again. Only the parent token ends the client for good.
//!
//! Per connection the task layout is fixed: a single writer owns the
//! transport's send side, an encryptor owns the send session and reads the
//! device, a reader owns the receive session, and the keepalive prober
//! watches receive activity. Control plaintext (keepalives, service frames)
//! reaches the encryptor over a bounded channel, so every outgoing record
//! passes one nonce counter in order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use veil_core::config::{ConnectionSettings, Protocol, RekeyPolicy};
use veil_core::ip;
use veil_crypto::{
    kdf, Nonce, RecvSession, RekeyController, Role, SendSession, Session, DEFAULT_REPLAY_WINDOW,
};
use veil_wire::service::{self, FrameBuf, FrameKind};
use veil_wire::{encode_datagram, is_keepalive, parse_datagram, TcpFrameCodec, KEEPALIVE};

use crate::device::TunDevice;
use crate::handshake::SessionEstablisher;
use crate::keepalive::{spawn_prober, Activity, KeepaliveParams};
use crate::{Error, Result};

const CONTROL_DEPTH: usize = 32;
const RECORD_DEPTH: usize = 256;
const READ_BUF: usize = 65535;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Connection lifecycle, surfaced through tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    Dialing,
    Handshaking,
    Established,
    Draining,
    Reconnecting,
    Closed,
}

fn transition(state: &mut ClientState, next: ClientState) {
    if *state != next {
        debug!(from = ?*state, to = ?next, "client state");
        *state = next;
    }
}

/// Run the client dataplane until `cancel` fires.
pub async fn run_client<D: TunDevice>(
    settings: ConnectionSettings,
    rekey: RekeyPolicy,
    device: Arc<D>,
    establisher: Arc<dyn SessionEstablisher>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut state = ClientState::Init;
    let mut backoff = INITIAL_BACKOFF;
    let max_backoff = settings.dial_timeout.max(INITIAL_BACKOFF);

    loop {
        if cancel.is_cancelled() {
            transition(&mut state, ClientState::Closed);
            return Ok(());
        }
        transition(&mut state, ClientState::Dialing);
        let outcome = match settings.protocol {
            Protocol::Tcp => {
                run_tcp_once(&settings, &device, establisher.as_ref(), &cancel, &mut state).await
            }
            Protocol::Udp => {
                run_udp_once(&settings, &rekey, &device, establisher.as_ref(), &cancel, &mut state)
                    .await
            }
        };
        match outcome {
            Ok(ran_established) => {
                if ran_established {
                    // the connection was up; start the backoff ladder over
                    backoff = INITIAL_BACKOFF;
                }
            }
            Err(e) => {
                warn!(error = %e, "connection attempt failed");
            }
        }
        if cancel.is_cancelled() {
            transition(&mut state, ClientState::Closed);
            return Ok(());
        }
        transition(&mut state, ClientState::Reconnecting);
        tokio::select! {
            _ = cancel.cancelled() => {
                transition(&mut state, ClientState::Closed);
                return Ok(());
            }
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(max_backoff);
    }
}

async fn resolve(settings: &ConnectionSettings) -> Result<std::net::SocketAddr> {
    let target = format!("{}:{}", settings.server_host, settings.server_port);
    let result = lookup_host(&target)
        .await?
        .next()
        .ok_or_else(|| Error::HandshakeFailed(format!("{target} did not resolve")));
    result
}

/// One TCP connection from dial to teardown. Returns whether the connection
/// reached the established state.
async fn run_tcp_once<D: TunDevice>(
    settings: &ConnectionSettings,
    device: &Arc<D>,
    establisher: &dyn SessionEstablisher,
    parent: &CancellationToken,
    state: &mut ClientState,
) -> Result<bool> {
    let addr = resolve(settings).await?;
    let stream = tokio::select! {
        _ = parent.cancelled() => return Ok(false),
        dialed = tokio::time::timeout(settings.dial_timeout, TcpStream::connect(addr)) => {
            dialed.map_err(|_| Error::DialTimeout)??
        }
    };
    stream.set_nodelay(true)?;

    transition(state, ClientState::Handshaking);
    let outcome = tokio::time::timeout(settings.dial_timeout, establisher.establish_client())
        .await
        .map_err(|_| Error::DialTimeout)??;
    transition(state, ClientState::Established);
    info!(server = %addr, ip = %outcome.internal_ip, "tcp tunnel established");

    let session = Session::new(
        outcome.material.for_role(Role::Client),
        outcome.session_id,
        Role::Client,
    );
    let (send, recv) = session.split();
    let (read_half, write_half) = stream.into_split();
    let framed_read = FramedRead::new(read_half, TcpFrameCodec::new());
    let framed_write = FramedWrite::new(write_half, TcpFrameCodec::new());

    let conn = parent.child_token();
    let activity = Activity::new();
    activity.mark();

    let (ctrl_tx, ctrl_rx) = mpsc::channel::<Vec<u8>>(CONTROL_DEPTH);
    let (record_tx, record_rx) = mpsc::channel::<Bytes>(RECORD_DEPTH);

    let prober = spawn_prober(
        KeepaliveParams {
            send_interval: settings.keepalive_send,
            reconnect_interval: settings.keepalive_timeout,
        },
        activity.clone(),
        ctrl_tx.clone(),
        conn.clone(),
    );
    let writer = tokio::spawn(tcp_write_loop(framed_write, record_rx, conn.clone()));
    let encryptor = tokio::spawn(encrypt_loop_tcp(
        device.clone(),
        send,
        ctrl_rx,
        record_tx,
        conn.clone(),
        settings.mtu as usize,
    ));
    let reader = tokio::spawn(tcp_read_loop(
        framed_read,
        recv,
        device.clone(),
        ctrl_tx.clone(),
        activity,
        conn.clone(),
    ));

    send_mtu_probe(&ctrl_tx, settings.mtu).await;

    conn.cancelled().await;
    transition(state, ClientState::Draining);
    drop(ctrl_tx);
    let _ = tokio::join!(prober, writer, encryptor, reader);
    Ok(true)
}

async fn tcp_write_loop(
    mut framed: FramedWrite<tokio::net::tcp::OwnedWriteHalf, TcpFrameCodec>,
    mut records: mpsc::Receiver<Bytes>,
    conn: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = conn.cancelled() => break,
            item = records.recv() => match item {
                None => break,
                Some(record) => {
                    if let Err(e) = framed.send(record).await {
                        warn!(error = %e, "transport write failed");
                        conn.cancel();
                        break;
                    }
                }
            }
        }
    }
}

enum Outbound {
    Control(Vec<u8>),
    Device(usize),
}

async fn encrypt_loop_tcp<D: TunDevice>(
    device: Arc<D>,
    mut send: SendSession,
    mut control: mpsc::Receiver<Vec<u8>>,
    records: mpsc::Sender<Bytes>,
    conn: CancellationToken,
    mtu: usize,
) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let item = tokio::select! {
            _ = conn.cancelled() => break,
            ctrl = control.recv() => match ctrl {
                None => break,
                Some(plain) => Outbound::Control(plain),
            },
            read = device.recv(&mut buf) => match read {
                Err(e) => {
                    warn!(error = %e, "device read failed");
                    conn.cancel();
                    break;
                }
                Ok(n) if n > mtu => {
                    debug!(len = n, mtu, "dropping oversize packet");
                    continue;
                }
                Ok(n) => Outbound::Device(n),
            },
        };
        let plaintext: &[u8] = match &item {
            Outbound::Control(p) => p,
            Outbound::Device(n) => &buf[..*n],
        };
        match send.seal(plaintext) {
            Ok(sealed) => {
                if records.send(Bytes::from(sealed.ciphertext)).await.is_err() {
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

async fn tcp_read_loop<D: TunDevice>(
    mut framed: FramedRead<tokio::net::tcp::OwnedReadHalf, TcpFrameCodec>,
    mut recv: RecvSession,
    device: Arc<D>,
    ctrl_tx: mpsc::Sender<Vec<u8>>,
    activity: Activity,
    conn: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = conn.cancelled() => break,
            item = framed.next() => match item {
                None => {
                    info!("server closed the stream");
                    conn.cancel();
                    break;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "transport read failed");
                    conn.cancel();
                    break;
                }
                Some(Ok(record)) => record,
            },
        };
        match recv.open_next(&record) {
            Ok(plain) => {
                activity.mark();
                deliver_inbound(&plain, &device, &ctrl_tx, &conn, None).await;
            }
            Err(e) => {
                // a stream record that fails authentication desyncs the
                // counters for good; reconnect with fresh keys
                warn!(error = %e, "record failed authentication");
                conn.cancel();
                break;
            }
        }
    }
}

/// One UDP "connection" from dial to teardown.
async fn run_udp_once<D: TunDevice>(
    settings: &ConnectionSettings,
    rekey: &RekeyPolicy,
    device: &Arc<D>,
    establisher: &dyn SessionEstablisher,
    parent: &CancellationToken,
    state: &mut ClientState,
) -> Result<bool> {
    let addr = resolve(settings).await?;
    let bind_addr = if addr.is_ipv4() {
        std::net::SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
    } else {
        std::net::SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0)
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;
    let socket = Arc::new(socket);

    transition(state, ClientState::Handshaking);
    let outcome = tokio::time::timeout(settings.dial_timeout, establisher.establish_client())
        .await
        .map_err(|_| Error::DialTimeout)??;
    transition(state, ClientState::Established);
    info!(server = %addr, ip = %outcome.internal_ip, "udp tunnel established");

    let controller = Arc::new(Mutex::new(RekeyController::new(
        outcome.material.clone().for_role(Role::Client),
        outcome.session_id,
        Role::Client,
        Duration::from_secs(rekey.pending_timeout_secs),
        DEFAULT_REPLAY_WINDOW,
    )));

    let conn = parent.child_token();
    let activity = Activity::new();
    activity.mark();

    let (ctrl_tx, ctrl_rx) = mpsc::channel::<Vec<u8>>(CONTROL_DEPTH);
    let (dgram_tx, dgram_rx) = mpsc::channel::<Vec<u8>>(RECORD_DEPTH);

    let prober = spawn_prober(
        KeepaliveParams {
            send_interval: settings.keepalive_send,
            reconnect_interval: settings.keepalive_timeout,
        },
        activity.clone(),
        ctrl_tx.clone(),
        conn.clone(),
    );
    let writer = tokio::spawn(udp_write_loop(socket.clone(), dgram_rx, conn.clone()));
    let encryptor = tokio::spawn(encrypt_loop_udp(
        device.clone(),
        controller.clone(),
        ctrl_rx,
        dgram_tx,
        conn.clone(),
        settings.mtu as usize,
    ));
    let reader = tokio::spawn(udp_read_loop(
        socket.clone(),
        controller.clone(),
        device.clone(),
        ctrl_tx.clone(),
        activity,
        conn.clone(),
    ));
    let rekeyer = tokio::spawn(rekey_loop(
        controller.clone(),
        outcome.base_secret,
        rekey.clone(),
        ctrl_tx.clone(),
        conn.clone(),
    ));

    // announce ourselves so the server can map our endpoint, then probe the path
    let _ = ctrl_tx.send(KEEPALIVE.to_vec()).await;
    send_mtu_probe(&ctrl_tx, settings.mtu).await;

    conn.cancelled().await;
    transition(state, ClientState::Draining);
    drop(ctrl_tx);
    let _ = tokio::join!(prober, writer, encryptor, reader, rekeyer);
    Ok(true)
}

async fn udp_write_loop(
    socket: Arc<UdpSocket>,
    mut datagrams: mpsc::Receiver<Vec<u8>>,
    conn: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = conn.cancelled() => break,
            item = datagrams.recv() => match item {
                None => break,
                Some(datagram) => {
                    if let Err(e) = socket.send(&datagram).await {
                        warn!(error = %e, "transport write failed");
                        conn.cancel();
                        break;
                    }
                }
            }
        }
    }
}

async fn encrypt_loop_udp<D: TunDevice>(
    device: Arc<D>,
    controller: Arc<Mutex<RekeyController>>,
    mut control: mpsc::Receiver<Vec<u8>>,
    datagrams: mpsc::Sender<Vec<u8>>,
    conn: CancellationToken,
    mtu: usize,
) {
    let mut buf = vec![0u8; READ_BUF];
    let mut frame = Vec::with_capacity(READ_BUF);
    loop {
        let item = tokio::select! {
            _ = conn.cancelled() => break,
            ctrl = control.recv() => match ctrl {
                None => break,
                Some(plain) => Outbound::Control(plain),
            },
            read = device.recv(&mut buf) => match read {
                Err(e) => {
                    warn!(error = %e, "device read failed");
                    conn.cancel();
                    break;
                }
                Ok(n) if n > mtu => {
                    debug!(len = n, mtu, "dropping oversize packet");
                    continue;
                }
                Ok(n) => Outbound::Device(n),
            },
        };
        let plaintext: &[u8] = match &item {
            Outbound::Control(p) => p,
            Outbound::Device(n) => &buf[..*n],
        };
        let sealed = {
            let mut ctrl = controller.lock().await;
            ctrl.encrypt(plaintext)
        };
        match sealed {
            Ok((epoch, packet)) => {
                encode_datagram(
                    (epoch & 0xff) as u8,
                    &packet.nonce.to_bytes(),
                    &packet.ciphertext,
                    &mut frame,
                );
                if datagrams.send(frame.clone()).await.is_err() {
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

async fn udp_read_loop<D: TunDevice>(
    socket: Arc<UdpSocket>,
    controller: Arc<Mutex<RekeyController>>,
    device: Arc<D>,
    ctrl_tx: mpsc::Sender<Vec<u8>>,
    activity: Activity,
    conn: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let len = tokio::select! {
            _ = conn.cancelled() => break,
            received = socket.recv(&mut buf) => match received {
                Ok(len) => len,
                Err(e) => {
                    warn!(error = %e, "transport read failed");
                    conn.cancel();
                    break;
                }
            },
        };
        let view = match parse_datagram(&buf[..len]) {
            Ok(view) => view,
            Err(e) => {
                debug!(error = %e, len, "dropping malformed datagram");
                continue;
            }
        };
        let nonce = Nonce::from_bytes(&view.nonce);
        let opened = {
            let mut ctrl = controller.lock().await;
            ctrl.decrypt(view.epoch_tag, nonce, view.ciphertext)
        };
        match opened {
            Ok(plain) => {
                activity.mark();
                deliver_inbound(&plain, &device, &ctrl_tx, &conn, Some(&controller)).await;
            }
            Err(e) => {
                // replay, unknown epoch and tag failures all cost one datagram
                debug!(error = %e, "dropping datagram");
            }
        }
    }
}

/// Periodic rekey housekeeping for the datagram transport: abort pendings
/// that outlived their timeout and initiate a rekey when the cadence says so.
async fn rekey_loop(
    controller: Arc<Mutex<RekeyController>>,
    base_secret: [u8; 32],
    policy: RekeyPolicy,
    ctrl_tx: mpsc::Sender<Vec<u8>>,
    conn: CancellationToken,
) {
    let pending_timeout = Duration::from_secs(policy.pending_timeout_secs);
    let max_age = Duration::from_secs(policy.max_age_secs);
    let tick = (pending_timeout / 4).clamp(Duration::from_millis(20), Duration::from_secs(1));
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut framebuf = FrameBuf::new();
    loop {
        tokio::select! {
            _ = conn.cancelled() => break,
            _ = interval.tick() => {}
        }
        let init = {
            let mut ctrl = controller.lock().await;
            let now = Instant::now();
            ctrl.maybe_abort_pending(now);
            if !ctrl.needs_rekey(policy.max_packets, max_age, now) {
                continue;
            }
            let epoch = ctrl.next_epoch_id();
            let share: [u8; 32] = rand::random();
            let keys = match kdf::derive_epoch_keys(&base_secret, &share, epoch) {
                Ok(material) => material.for_role(Role::Client),
                Err(e) => {
                    error!(error = %e, "epoch key derivation failed");
                    continue;
                }
            };
            match ctrl.rekey_and_apply(keys) {
                Ok(applied) => {
                    debug_assert_eq!(applied, epoch);
                    Some((share, applied))
                }
                Err(e) => {
                    debug!(error = %e, "rekey not initiated");
                    None
                }
            }
        };
        if let Some((share, epoch)) = init {
            let body = service::rekey_init_body(&share, epoch);
            match framebuf.marshal(FrameKind::RekeyInit, 0, &body) {
                Ok(frame) => {
                    info!(epoch, "initiating rekey");
                    if ctrl_tx.send(frame.to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!(error = %e, "rekey frame marshal failed"),
            }
        }
    }
}

async fn send_mtu_probe(ctrl_tx: &mpsc::Sender<Vec<u8>>, mtu: u16) {
    // probe body sized so the whole frame matches the configured tunnel MTU
    let body_len = (mtu as usize).saturating_sub(service::HEADER_LEN);
    let mut framebuf = FrameBuf::new();
    if let Ok(frame) = framebuf.marshal(FrameKind::MtuProbe, 0, &vec![0u8; body_len]) {
        let _ = ctrl_tx.send(frame.to_vec()).await;
    }
}

/// Route one decrypted payload: filter keepalives, intercept service frames,
/// hand real packets to the device. `controller` is present on the datagram
/// path and receives rekey acknowledgements.
async fn deliver_inbound<D: TunDevice>(
    plain: &[u8],
    device: &Arc<D>,
    ctrl_tx: &mpsc::Sender<Vec<u8>>,
    conn: &CancellationToken,
    controller: Option<&Arc<Mutex<RekeyController>>>,
) {
    if is_keepalive(plain) {
        return;
    }
    if service::is_service_frame(plain) {
        match service::unmarshal(plain) {
            Ok(frame) => {
                handle_service_frame(frame, ctrl_tx, conn, controller).await;
                return;
            }
            Err(e) => {
                // almost certainly a corrupted control frame; only ever
                // forward it if it happens to be a parseable IP packet
                debug!(error = %e, "malformed service frame");
                if ip::version(plain).is_err() {
                    return;
                }
            }
        }
    }
    if let Err(e) = device.send(plain).await {
        warn!(error = %e, "device write failed");
        conn.cancel();
    }
}

async fn handle_service_frame(
    frame: service::ServiceFrame<'_>,
    ctrl_tx: &mpsc::Sender<Vec<u8>>,
    conn: &CancellationToken,
    controller: Option<&Arc<Mutex<RekeyController>>>,
) {
    match frame.kind {
        FrameKind::SessionReset => {
            info!("server reset the session");
            conn.cancel();
        }
        FrameKind::MtuProbe => {
            let mut framebuf = FrameBuf::new();
            let body = service::mtu_ack_body(frame.body.len() as u16);
            if let Ok(ack) = framebuf.marshal(FrameKind::MtuAck, 0, &body) {
                let _ = ctrl_tx.send(ack.to_vec()).await;
            }
        }
        FrameKind::MtuAck => match service::parse_mtu_ack(frame.body) {
            Ok(probed) => debug!(probed, "path confirmed for probe size"),
            Err(e) => debug!(error = %e, "bad mtu ack"),
        },
        FrameKind::RekeyAck => {
            if let Some(controller) = controller {
                match service::parse_rekey_ack(frame.body) {
                    Ok(epoch) => {
                        let mut ctrl = controller.lock().await;
                        ctrl.confirm_send_epoch(epoch);
                        info!(epoch, "rekey confirmed");
                    }
                    Err(e) => debug!(error = %e, "bad rekey ack"),
                }
            } else {
                debug!("rekey ack ignored on stream transport");
            }
        }
        FrameKind::RekeyInit => {
            // only the client initiates in this deployment
            debug!("unexpected rekey init from server");
        }
    }
}
