//! Length-prefixed framing for `tokio_util::codec`.
//!
//! ```text
//! [Length u32 BE] [Payload(Length)]
//! ```
//!
//! The codec only cuts frames. Turning a payload into a handshake or signal
//! proxy message is left to the layers above.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, Result};

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(len));
        }

        let total = LENGTH_PREFIX + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            // The peer went away halfway through a frame.
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        if payload.len() > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(payload.len()));
        }
        dst.reserve(LENGTH_PREFIX + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn partial_frames_wait_for_more() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0, 0, 0, 4, 1, 2][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);
        buf.extend_from_slice(&[3, 4, 9]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], &[1, 2, 3, 4]);
        assert_eq!(&buf[..], &[9]);
    }

    #[test]
    fn oversized_length_is_rejected_before_buffering() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::from(&[0, 0, 1, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::OversizedPacket(256))
        ));
        let mut out = BytesMut::new();
        assert!(codec.encode(Bytes::from(vec![0u8; 17]), &mut out).is_err());
    }

    #[test]
    fn eof_mid_frame_is_connection_closed() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0, 0, 0, 8, 1][..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(ProtocolError::ConnectionClosed)
        ));
        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn encode_prefixes_length() {
        let mut codec = FrameCodec::default();
        let mut out = BytesMut::new();
        codec.encode(Bytes::from_static(b"abc"), &mut out).unwrap();
        assert_eq!(&out[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }
}
