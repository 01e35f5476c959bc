#![forbid(unsafe_code)]

//! Veil wire formats.
//! - Service frames: length-delimited control messages carried inside the
//!   encrypted tunnel payload (rekey, MTU probing, session reset)
//! - Stream framing: 4-byte big-endian length prefix per record
//! - Datagram layout: epoch tag, explicit nonce, ciphertext
//! - Keepalive payload shared by both transports

pub mod keepalive;
pub mod service;
pub mod tcp;
pub mod udp;

pub use keepalive::{is_keepalive, KEEPALIVE};
pub use service::{FrameBuf, FrameKind, ServiceFrame};
pub use tcp::TcpFrameCodec;
pub use udp::{encode_datagram, parse_datagram, DatagramView};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("input shorter than header")]
    TooShort,
    #[error("bad frame magic")]
    BadMagic,
    #[error("unsupported frame version {0}")]
    BadVersion(u8),
    #[error("unknown frame kind {0}")]
    BadKind(u8),
    #[error("frame body of {0} bytes exceeds the maximum")]
    BodyTooLarge(usize),
    #[error("frame body truncated")]
    BodyTruncated,
    #[error("record of {0} bytes below the framing minimum")]
    RecordTooShort(usize),
    #[error("record of {0} bytes exceeds the framing maximum")]
    RecordTooLarge(usize),
}

pub type Result<T> = core::result::Result<T, Error>;
