use crate::config::MAX_FRAME_SIZE;
use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the little-endian length prefix in front of every frame
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Length-prefixed frame codec for stream transports.
///
/// Each frame is `<u32 LE length><payload>`. Decoded frames are handed out as
/// frozen `Bytes` split off the read buffer, so no payload copy is made.
#[derive(Debug, Clone)]
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

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(len));
        }

        let total = LENGTH_PREFIX_SIZE + len;
        if src.len() < total {
            // Wait for the rest of the payload
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(item.len()));
        }
        let len = u32::try_from(item.len())
            .map_err(|_| ProtocolError::InvalidData(constants::ERR_LENGTH_PREFIX.to_string()))?;

        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        dst.put_u32_le(len);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[5u8, 0, 0, 0, b'h', b'e', b'l', b'l', b'o'][..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_waits_for_prefix_and_payload() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[3u8, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0, 0, b'a']);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"bc");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"abc");
    }

    #[test]
    fn test_decode_empty_payload() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::from(&[17u8, 0, 0, 0][..]);
        match codec.decode(&mut buf) {
            Err(ProtocolError::OversizedPacket(17)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_encode_writes_le_prefix() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"hello"), &mut buf).unwrap();
        assert_eq!(&buf[..], &[5u8, 0, 0, 0, b'h', b'e', b'l', b'l', b'o'][..]);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::new();
        assert!(codec.encode(Bytes::from_static(b"hello"), &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"one"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"two"), &mut buf).unwrap();
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"two");
    }
}
