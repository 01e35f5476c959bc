//! In-band service frames.
//!
//! A service frame travels inside the AEAD plaintext and carries control
//! traffic that must not reach the tunnel device: rekey negotiation, MTU
//! probing and session resets. The layout is a fixed 7-byte header followed
//! by the body:
//!
//! ```text
//! off 0-1  magic       "SF"
//! off 2    version     1
//! off 3    kind
//! off 4    flags       reserved, 0 in v1
//! off 5-6  body length u16 big-endian
//! off 7..  body
//! ```

use crate::{Error, Result};

pub const MAGIC: [u8; 2] = *b"SF";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 7;
/// Ceiling chosen so header + body always fits a u16-described packet.
pub const MAX_BODY: usize = u16::MAX as usize - HEADER_LEN;

/// Size of the key share carried by a rekey initiation.
pub const REKEY_SHARE_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Server-initiated teardown notice.
    SessionReset = 1,
    /// Padding-sized probe for path MTU discovery.
    MtuProbe = 10,
    /// Echo of a probe's body length.
    MtuAck = 11,
    /// Key share plus proposed epoch for a rekey.
    RekeyInit = 20,
    /// Acknowledgement of the proposed epoch.
    RekeyAck = 21,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::SessionReset),
            10 => Ok(FrameKind::MtuProbe),
            11 => Ok(FrameKind::MtuAck),
            20 => Ok(FrameKind::RekeyInit),
            21 => Ok(FrameKind::RekeyAck),
            other => Err(Error::BadKind(other)),
        }
    }
}

/// A parsed frame. `body` borrows the input buffer, so mutating the input
/// afterwards mutates the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceFrame<'a> {
    pub kind: FrameKind,
    pub flags: u8,
    pub body: &'a [u8],
}

/// Reusable marshal buffer. The slice returned by [`FrameBuf::marshal`] is
/// only valid until the next call on the same buffer.
#[derive(Debug, Default)]
pub struct FrameBuf {
    buf: Vec<u8>,
}

impl FrameBuf {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(HEADER_LEN + 64) }
    }

    /// Serialize a frame. Validation happens before any byte is written, so
    /// a failed call leaves no partial output behind.
    pub fn marshal(&mut self, kind: FrameKind, flags: u8, body: &[u8]) -> Result<&[u8]> {
        if body.len() > MAX_BODY {
            return Err(Error::BodyTooLarge(body.len()));
        }
        self.buf.clear();
        self.buf.reserve(HEADER_LEN + body.len());
        self.buf.extend_from_slice(&MAGIC);
        self.buf.push(VERSION);
        self.buf.push(kind as u8);
        self.buf.push(flags);
        self.buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(body);
        Ok(&self.buf)
    }
}

/// Parse a frame from `data`. Trailing bytes past the declared body are
/// tolerated and ignored.
pub fn unmarshal(data: &[u8]) -> Result<ServiceFrame<'_>> {
    if data.len() < HEADER_LEN {
        return Err(Error::TooShort);
    }
    if data[..2] != MAGIC {
        return Err(Error::BadMagic);
    }
    if data[2] != VERSION {
        return Err(Error::BadVersion(data[2]));
    }
    let kind = FrameKind::try_from(data[3])?;
    let flags = data[4];
    let body_len = u16::from_be_bytes([data[5], data[6]]) as usize;
    if body_len > MAX_BODY {
        return Err(Error::BodyTooLarge(body_len));
    }
    if data.len() < HEADER_LEN + body_len {
        return Err(Error::BodyTruncated);
    }
    Ok(ServiceFrame {
        kind,
        flags,
        body: &data[HEADER_LEN..HEADER_LEN + body_len],
    })
}

/// Cheap pre-filter: does this decrypted payload look like a service frame?
/// Used by the pipeline to decide between control handling and the device.
pub fn is_service_frame(data: &[u8]) -> bool {
    data.len() >= 3 && data[..2] == MAGIC && data[2] == VERSION
}

/// Body of a `RekeyInit`: 32-byte share followed by the proposed epoch.
pub fn rekey_init_body(share: &[u8; REKEY_SHARE_LEN], epoch: u64) -> [u8; REKEY_SHARE_LEN + 8] {
    let mut body = [0u8; REKEY_SHARE_LEN + 8];
    body[..REKEY_SHARE_LEN].copy_from_slice(share);
    body[REKEY_SHARE_LEN..].copy_from_slice(&epoch.to_be_bytes());
    body
}

pub fn parse_rekey_init(body: &[u8]) -> Result<([u8; REKEY_SHARE_LEN], u64)> {
    if body.len() < REKEY_SHARE_LEN + 8 {
        return Err(Error::BodyTruncated);
    }
    let mut share = [0u8; REKEY_SHARE_LEN];
    share.copy_from_slice(&body[..REKEY_SHARE_LEN]);
    let mut epoch = [0u8; 8];
    epoch.copy_from_slice(&body[REKEY_SHARE_LEN..REKEY_SHARE_LEN + 8]);
    Ok((share, u64::from_be_bytes(epoch)))
}

/// Body of a `RekeyAck`: the confirmed epoch.
pub fn rekey_ack_body(epoch: u64) -> [u8; 8] {
    epoch.to_be_bytes()
}

pub fn parse_rekey_ack(body: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = body.try_into().map_err(|_| Error::BodyTruncated)?;
    Ok(u64::from_be_bytes(bytes))
}

/// Body of an `MtuAck`: the probed body length, echoed back.
pub fn mtu_ack_body(probed: u16) -> [u8; 2] {
    probed.to_be_bytes()
}

pub fn parse_mtu_ack(body: &[u8]) -> Result<u16> {
    let bytes: [u8; 2] = body.try_into().map_err(|_| Error::BodyTruncated)?;
    Ok(u16::from_be_bytes(bytes))
}
