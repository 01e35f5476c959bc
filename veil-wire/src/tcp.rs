//! Stream record framing: each record is a u32 big-endian length prefix
//! followed by the AEAD ciphertext. The decoder buffers partial input and
//! refuses absurd lengths before allocating for them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Error, Result};

pub const LEN_PREFIX: usize = 4;
/// Largest ciphertext a record may carry.
pub const MAX_RECORD: usize = 65535;
/// Smallest declarable record length.
pub const MIN_RECORD: usize = 4;

#[derive(Debug, Default)]
pub struct TcpFrameCodec;

impl TcpFrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for TcpFrameCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut len_bytes = &src[..LEN_PREFIX];
        let len = len_bytes.get_u32() as usize;
        if len < MIN_RECORD {
            return Err(Error::RecordTooShort(len));
        }
        if len > MAX_RECORD {
            return Err(Error::RecordTooLarge(len));
        }
        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for TcpFrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() < MIN_RECORD {
            return Err(Error::RecordTooShort(item.len()));
        }
        if item.len() > MAX_RECORD {
            return Err(Error::RecordTooLarge(item.len()));
        }
        dst.reserve(LEN_PREFIX + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() -> Result<()> {
        let mut codec = TcpFrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"ciphertext-bytes"), &mut buf)?;
        let got = codec.decode(&mut buf)?.unwrap();
        assert_eq!(&got[..], b"ciphertext-bytes");
        assert!(buf.is_empty());
        Ok(())
    }

    #[test]
    fn partial_input_waits() -> Result<()> {
        let mut codec = TcpFrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"0123456789"), &mut buf)?;
        let full = buf.split();

        let mut acc = BytesMut::new();
        acc.extend_from_slice(&full[..3]);
        assert!(codec.decode(&mut acc)?.is_none());
        acc.extend_from_slice(&full[3..8]);
        assert!(codec.decode(&mut acc)?.is_none());
        acc.extend_from_slice(&full[8..]);
        assert_eq!(&codec.decode(&mut acc)?.unwrap()[..], b"0123456789");
        Ok(())
    }

    #[test]
    fn back_to_back_records() -> Result<()> {
        let mut codec = TcpFrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"first-record"), &mut buf)?;
        codec.encode(Bytes::from_static(b"second-record"), &mut buf)?;
        assert_eq!(&codec.decode(&mut buf)?.unwrap()[..], b"first-record");
        assert_eq!(&codec.decode(&mut buf)?.unwrap()[..], b"second-record");
        assert!(codec.decode(&mut buf)?.is_none());
        Ok(())
    }

    #[test]
    fn oversized_length_rejected_before_body_arrives() {
        let mut codec = TcpFrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::RecordTooLarge(_))
        ));
    }

    #[test]
    fn undersized_length_rejected() {
        let mut codec = TcpFrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.extend_from_slice(&[0u8; 2]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::RecordTooShort(2))
        ));
    }

    #[test]
    fn encoder_refuses_out_of_range_payloads() {
        let mut codec = TcpFrameCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.encode(Bytes::from_static(b"ab"), &mut buf).is_err());
        let big = Bytes::from(vec![0u8; MAX_RECORD + 1]);
        assert!(codec.encode(big, &mut buf).is_err());
        assert!(buf.is_empty(), "failed encode must not emit bytes");
    }
}
