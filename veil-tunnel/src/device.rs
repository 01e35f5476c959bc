//! Tunnel device abstraction.
//!
//! The dataplane only ever needs byte-oriented read/write of whole IP
//! packets; creating the interface, assigning addresses and setting the MTU
//! belong to the platform integration that hands us an implementor.
//!
//! Two implementations live here: [`MemoryTun`], an in-process pair used by
//! tests and loopback runs, and [`UnixSocketTun`], which speaks
//! length-prefixed packets over a Unix socket to whatever process owns the
//! real interface.

use async_trait::async_trait;
use std::io;
use tokio::sync::{mpsc, Mutex};

/// Byte-oriented packet device. One `recv` yields exactly one IP packet.
#[async_trait]
pub trait TunDevice: Send + Sync + 'static {
    /// Read one packet into `buf`, returning its length. An error means the
    /// device is gone and the connection should wind down.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet.
    async fn send(&self, packet: &[u8]) -> io::Result<()>;
}

/// In-memory device: packets are exchanged over channels with a
/// [`MemoryTunHandle`] standing in for the operating system.
pub struct MemoryTun {
    from_os: Mutex<mpsc::Receiver<Vec<u8>>>,
    to_os: mpsc::Sender<Vec<u8>>,
}

/// Test-side handle: inject packets the dataplane will read, and observe
/// packets the dataplane wrote.
pub struct MemoryTunHandle {
    to_device: mpsc::Sender<Vec<u8>>,
    from_device: Mutex<mpsc::Receiver<Vec<u8>>>,
}

/// Build a connected device/handle pair.
pub fn memory_pair(capacity: usize) -> (std::sync::Arc<MemoryTun>, MemoryTunHandle) {
    let (inject_tx, inject_rx) = mpsc::channel(capacity);
    let (deliver_tx, deliver_rx) = mpsc::channel(capacity);
    let device = MemoryTun {
        from_os: Mutex::new(inject_rx),
        to_os: deliver_tx,
    };
    let handle = MemoryTunHandle {
        to_device: inject_tx,
        from_device: Mutex::new(deliver_rx),
    };
    (std::sync::Arc::new(device), handle)
}

#[async_trait]
impl TunDevice for MemoryTun {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .from_os
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "device closed"))?;
        if packet.len() > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "packet exceeds read buffer",
            ));
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.to_os
            .send(packet.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device closed"))
    }
}

impl MemoryTunHandle {
    /// Feed a packet into the device, as if the kernel routed it there.
    pub async fn inject(&self, packet: &[u8]) -> io::Result<()> {
        self.to_device
            .send(packet.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device closed"))
    }

    /// Next packet the dataplane delivered, or `None` once the device closed.
    pub async fn next_delivered(&self) -> Option<Vec<u8>> {
        self.from_device.lock().await.recv().await
    }

    /// Non-blocking variant used to assert that nothing was delivered.
    pub fn try_next_delivered(&self) -> Option<Vec<u8>> {
        self.from_device.try_lock().ok()?.try_recv().ok()
    }
}

/// Device bridged over a Unix socket: each packet is `len (u16 BE) || bytes`.
/// The peer process owns the real interface and relays packets verbatim.
#[cfg(unix)]
pub struct UnixSocketTun {
    reader: Mutex<tokio::net::unix::OwnedReadHalf>,
    writer: Mutex<tokio::net::unix::OwnedWriteHalf>,
}

#[cfg(unix)]
impl UnixSocketTun {
    pub async fn connect(path: &std::path::Path) -> io::Result<Self> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: tokio::net::UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[cfg(unix)]
#[async_trait]
impl TunDevice for UnixSocketTun {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        use tokio::io::AsyncReadExt;
        let mut reader = self.reader.lock().await;
        let len = reader.read_u16().await? as usize;
        if len > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "packet exceeds read buffer",
            ));
        }
        reader.read_exact(&mut buf[..len]).await?;
        Ok(len)
    }

    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let len = u16::try_from(packet.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "packet too large"))?;
        let mut writer = self.writer.lock().await;
        writer.write_u16(len).await?;
        writer.write_all(packet).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_carries_packets_both_ways() {
        let (device, handle) = memory_pair(8);

        handle.inject(b"from-os").await.unwrap();
        let mut buf = [0u8; 64];
        let n = device.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"from-os");

        device.send(b"to-os").await.unwrap();
        assert_eq!(handle.next_delivered().await.unwrap(), b"to-os");
    }

    #[tokio::test]
    async fn oversized_packet_is_an_error() {
        let (device, handle) = memory_pair(8);
        handle.inject(&[0u8; 100]).await.unwrap();
        let mut small = [0u8; 10];
        assert!(device.recv(&mut small).await.is_err());
    }

    #[tokio::test]
    async fn closed_handle_surfaces_as_broken_pipe() {
        let (device, handle) = memory_pair(8);
        drop(handle);
        let mut buf = [0u8; 16];
        let err = device.recv(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_device_roundtrip() {
        let (a, b) = tokio::net::UnixStream::pair().unwrap();
        let dev = UnixSocketTun::from_stream(a);
        let peer = UnixSocketTun::from_stream(b);

        dev.send(b"packet-one").await.unwrap();
        let mut buf = [0u8; 32];
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"packet-one");
    }
}
