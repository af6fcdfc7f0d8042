//! IPC frame codec
//!
//! ```text
//! ┌───────┬────────────┬────────┬─────────┐
//! │ crc32 │ message id │ length │ payload │
//! │ u32   │ u8         │ u16    │ ...     │
//! └───────┴────────────┴────────┴─────────┘
//! ```
//!
//! The CRC covers message id, length and payload. A frame never exceeds
//! `IPC_CHANNEL_MAX_MSG_SIZE` bytes, so a length field claiming more marks the
//! stream as corrupt instead of making the reader wait for bytes that never come.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use fpvlink_core::checksum::crc32;

use crate::IpcError;

pub const IPC_CHANNEL_MAX_MSG_SIZE: usize = 1600;
pub const IPC_FRAME_HEADER_SIZE: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcMessage {
    pub id: u8,
    pub payload: Bytes,
}

#[derive(Debug, Default)]
pub struct IpcCodec {
    next_id: u8,
}

impl IpcCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest payload a single frame can carry.
    pub fn max_payload() -> usize {
        IPC_CHANNEL_MAX_MSG_SIZE - IPC_FRAME_HEADER_SIZE
    }
}

impl Decoder for IpcCodec {
    type Item = IpcMessage;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < IPC_FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let length = u16::from_le_bytes([src[5], src[6]]) as usize;
        let frame_len = IPC_FRAME_HEADER_SIZE + length;
        if length == 0 || frame_len > IPC_CHANNEL_MAX_MSG_SIZE {
            return Err(IpcError::CorruptStream(format!("invalid frame length {}", length)));
        }
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let stored = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if stored != crc32(&src[4..frame_len]) {
            return Err(IpcError::CorruptStream("frame checksum mismatch".into()));
        }

        let mut frame = src.split_to(frame_len);
        frame.advance(4);
        let id = frame.get_u8();
        frame.advance(2);
        Ok(Some(IpcMessage { id, payload: frame.freeze() }))
    }
}

impl Encoder<Bytes> for IpcCodec {
    type Error = IpcError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if payload.is_empty() {
            return Err(IpcError::EmptyMessage);
        }
        if payload.len() > Self::max_payload() {
            return Err(IpcError::MessageTooLarge(payload.len()));
        }

        let start = dst.len();
        dst.reserve(IPC_FRAME_HEADER_SIZE + payload.len());
        dst.put_u32_le(0);
        dst.put_u8(self.next_id);
        dst.put_u16_le(payload.len() as u16);
        dst.put_slice(&payload);
        let crc = crc32(&dst[start + 4..]);
        dst[start..start + 4].copy_from_slice(&crc.to_le_bytes());

        self.next_id = self.next_id.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &'static [u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        IpcCodec::new().encode(Bytes::from_static(payload), &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_frame_layout() {
        let buf = frame(b"hi");
        assert_eq!(buf.len(), 9);
        assert_eq!(&buf[4..], &[0, 2, 0, b'h', b'i']);
        assert_eq!(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]), crc32(&buf[4..]));
    }

    #[test]
    fn test_message_ids_increment() {
        let mut codec = IpcCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"a"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"b"), &mut buf).unwrap();

        let mut decoder = IpcCodec::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().id, 0);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().id, 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let full = frame(b"telemetry");
        let mut buf = BytesMut::from(&full[..5]);
        assert_eq!(IpcCodec::new().decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[5..]);
        let message = IpcCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(&message.payload[..], b"telemetry");
    }

    #[test]
    fn test_corrupt_frames() {
        let mut buf = frame(b"rc");
        buf[8] ^= 0x01;
        assert!(matches!(IpcCodec::new().decode(&mut buf), Err(IpcError::CorruptStream(_))));

        let mut oversized = BytesMut::from(&[0u8, 0, 0, 0, 0, 0xFF, 0xFF][..]);
        assert!(matches!(IpcCodec::new().decode(&mut oversized), Err(IpcError::CorruptStream(_))));
    }

    #[test]
    fn test_encode_limits() {
        let mut buf = BytesMut::new();
        let mut codec = IpcCodec::new();
        assert!(matches!(codec.encode(Bytes::new(), &mut buf), Err(IpcError::EmptyMessage)));
        let big = Bytes::from(vec![0u8; IpcCodec::max_payload() + 1]);
        assert!(matches!(codec.encode(big, &mut buf), Err(IpcError::MessageTooLarge(_))));
        let exact = Bytes::from(vec![1u8; IpcCodec::max_payload()]);
        codec.encode(exact, &mut buf).unwrap();
        assert_eq!(buf.len(), IPC_CHANNEL_MAX_MSG_SIZE);
    }
}
