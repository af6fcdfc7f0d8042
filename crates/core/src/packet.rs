//! Wire packet codec
//!
//! Every radio and IPC packet starts with the same 24-byte little-endian header:
//!
//! ```text
//! ┌──────┬───────┬──────┬─────────────┬──────────┬────────┬──────────┬─────────┬──────────┐
//! │ crc  │ flags │ type │ stream|idx  │ ext flags│ length │ link idx │ src id  │ dest id  │
//! │ u32  │ u8    │ u8   │ u32 (4|28)  │ u16      │ u16    │ u16      │ u32     │ u32      │
//! └──────┴───────┴──────┴─────────────┴──────────┴────────┴──────────┴─────────┴──────────┘
//! ```
//!
//! The CRC covers everything after itself, or only the rest of the header when
//! `HEADERS_ONLY_CRC` is set. `decode` is the single trust boundary for wire data:
//! nothing downstream ever sees a packet that failed it.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::checksum::crc32;
use crate::types::{
    Component, StreamId, VehicleId, MAX_PACKET_TOTAL_SIZE, PACKET_HEADER_SIZE, PROTOCOL_VERSION,
};

const STREAM_INDEX_SHIFT: u32 = 28;
const STREAM_PACKET_INDEX_MASK: u32 = 0x0FFF_FFFF;
const COMPONENT_MASK: u8 = 0b0111;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer too short for a packet header ({0} bytes)")]
    TooShort(usize),

    #[error("declared length {declared} does not match buffer length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("declared length {0} exceeds the maximum packet size")]
    TooLarge(usize),

    #[error("packet checksum is invalid")]
    ChecksumInvalid,

    #[error("payload of {0} bytes does not fit in a packet")]
    PayloadTooLarge(usize),

    #[error("stream index {0} is out of range")]
    InvalidStream(u8),

    #[error("unknown component {0}")]
    UnknownComponent(u8),
}

bitflags! {
    /// Upper bits of the packet flags byte (the low 3 bits select the component).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u8 {
        const HEADERS_ONLY_CRC = 1 << 3;
        const RETRANSMITTED = 1 << 4;
        const ENCRYPTED = 1 << 6;
        const CAN_START_TX = 1 << 7;
    }
}

bitflags! {
    /// High byte of the extended flags (the low byte is the protocol version).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExtendedFlags: u16 {
        const HIGH_CAPACITY_LINK_ONLY = 1 << 8;
        const LOW_CAPACITY_LINK_ONLY = 1 << 9;
        const REQUIRE_ACK = 1 << 10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub component: Component,
    pub flags: PacketFlags,
    pub packet_type: u8,
    pub stream: StreamId,
    /// Low 28 bits of the stream field, monotonic per stream.
    pub stream_packet_index: u32,
    pub version: u8,
    pub extended: ExtendedFlags,
    pub radio_link_packet_index: u16,
    pub vehicle_id_src: VehicleId,
    pub vehicle_id_dest: VehicleId,
}

impl PacketHeader {
    pub fn new(component: Component, packet_type: u8, stream: StreamId) -> Self {
        Self {
            component,
            flags: PacketFlags::empty(),
            packet_type,
            stream,
            stream_packet_index: 0,
            version: PROTOCOL_VERSION,
            extended: ExtendedFlags::empty(),
            radio_link_packet_index: 0,
            vehicle_id_src: 0,
            vehicle_id_dest: 0,
        }
    }

    pub fn with_route(mut self, src: VehicleId, dest: VehicleId) -> Self {
        self.vehicle_id_src = src;
        self.vehicle_id_dest = dest;
        self
    }

    fn stream_field(&self) -> u32 {
        ((self.stream.get() as u32) << STREAM_INDEX_SHIFT)
            | (self.stream_packet_index & STREAM_PACKET_INDEX_MASK)
    }
}

/// A validated packet: header plus owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: impl Into<Bytes>) -> Self {
        Self { header, payload: payload.into() }
    }

    pub fn total_length(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        encode(&self.header, &self.payload)
    }
}

/// Frames `payload` behind `header` and fills in length and checksum.
pub fn encode(header: &PacketHeader, payload: &[u8]) -> Result<Bytes, CodecError> {
    let total = PACKET_HEADER_SIZE + payload.len();
    if total > MAX_PACKET_TOTAL_SIZE {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32_le(0);
    buf.put_u8((header.component as u8 & COMPONENT_MASK) | header.flags.bits());
    buf.put_u8(header.packet_type);
    buf.put_u32_le(header.stream_field());
    buf.put_u16_le((header.extended.bits() & 0xFF00) | header.version as u16);
    buf.put_u16_le(total as u16);
    buf.put_u16_le(header.radio_link_packet_index);
    buf.put_u32_le(header.vehicle_id_src);
    buf.put_u32_le(header.vehicle_id_dest);
    buf.put_slice(payload);

    let crc = crc32(&buf[4..crc_end(header.flags, total)]);
    buf[..4].copy_from_slice(&crc.to_le_bytes());
    Ok(buf.freeze())
}

/// Parses exactly one packet occupying the whole of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Packet, CodecError> {
    if bytes.len() < PACKET_HEADER_SIZE {
        return Err(CodecError::TooShort(bytes.len()));
    }
    let declared = declared_length(bytes);
    if declared > MAX_PACKET_TOTAL_SIZE {
        return Err(CodecError::TooLarge(declared));
    }
    if declared != bytes.len() {
        return Err(CodecError::LengthMismatch { declared, actual: bytes.len() });
    }

    let mut cursor = bytes;
    let crc = cursor.get_u32_le();
    let flags_byte = cursor.get_u8();
    let flags = PacketFlags::from_bits_truncate(flags_byte);
    if crc != crc32(&bytes[4..crc_end(flags, declared)]) {
        return Err(CodecError::ChecksumInvalid);
    }

    let component = Component::from_bits(flags_byte)
        .ok_or(CodecError::UnknownComponent(flags_byte & COMPONENT_MASK))?;
    let packet_type = cursor.get_u8();
    let stream_field = cursor.get_u32_le();
    let stream_bits = (stream_field >> STREAM_INDEX_SHIFT) as u8;
    let stream = StreamId::new(stream_bits).ok_or(CodecError::InvalidStream(stream_bits))?;
    let extended_raw = cursor.get_u16_le();
    let _total_length = cursor.get_u16_le();
    let radio_link_packet_index = cursor.get_u16_le();
    let vehicle_id_src = cursor.get_u32_le();
    let vehicle_id_dest = cursor.get_u32_le();

    let header = PacketHeader {
        component,
        flags,
        packet_type,
        stream,
        stream_packet_index: stream_field & STREAM_PACKET_INDEX_MASK,
        version: (extended_raw & 0xFF) as u8,
        extended: ExtendedFlags::from_bits_truncate(extended_raw),
        radio_link_packet_index,
        vehicle_id_src,
        vehicle_id_dest,
    };
    Ok(Packet { header, payload: Bytes::copy_from_slice(cursor) })
}

fn declared_length(bytes: &[u8]) -> usize {
    u16::from_le_bytes([bytes[12], bytes[13]]) as usize
}

fn crc_end(flags: PacketFlags, total: usize) -> usize {
    if flags.contains(PacketFlags::HEADERS_ONLY_CRC) {
        PACKET_HEADER_SIZE
    } else {
        total
    }
}

/// Iterates over packets concatenated in one send buffer.
///
/// Stops after the first invalid packet: the rest of the buffer cannot be
/// delimited once a length field is untrusted.
pub struct PacketChain<'a> {
    remaining: &'a [u8],
    failed: bool,
}

impl<'a> PacketChain<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { remaining: buffer, failed: false }
    }
}

impl Iterator for PacketChain<'_> {
    type Item = Result<Packet, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining.is_empty() {
            return None;
        }
        if self.remaining.len() < PACKET_HEADER_SIZE {
            self.failed = true;
            return Some(Err(CodecError::TooShort(self.remaining.len())));
        }
        let declared = declared_length(self.remaining);
        if declared < PACKET_HEADER_SIZE || declared > self.remaining.len() {
            self.failed = true;
            return Some(Err(CodecError::LengthMismatch {
                declared,
                actual: self.remaining.len(),
            }));
        }
        let (current, rest) = self.remaining.split_at(declared);
        self.remaining = rest;
        let result = decode(current);
        self.failed = result.is_err();
        Some(result)
    }
}

/// Decodes a whole chain, failing if any packet in it is invalid.
pub fn decode_chain(buffer: &[u8]) -> Result<Vec<Packet>, CodecError> {
    PacketChain::new(buffer).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn telemetry_header() -> PacketHeader {
        let mut header = PacketHeader::new(Component::Telemetry, 30, StreamId::TELEMETRY)
            .with_route(42, 7);
        header.stream_packet_index = 1234;
        header.radio_link_packet_index = 99;
        header
    }

    #[test]
    fn test_encode_layout() {
        let bytes = encode(&telemetry_header(), &[1, 2, 3]).unwrap();
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE + 3);
        assert_eq!(bytes[4], Component::Telemetry as u8);
        assert_eq!(bytes[5], 30);
        let stream_field = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        assert_eq!(stream_field >> 28, 1);
        assert_eq!(stream_field & 0x0FFF_FFFF, 1234);
        assert_eq!(u16::from_le_bytes([bytes[12], bytes[13]]), 27);
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        assert_eq!(decode(&[0u8; 10]), Err(CodecError::TooShort(10)));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut bytes = encode(&telemetry_header(), &[9; 16]).unwrap().to_vec();
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(CodecError::LengthMismatch { declared: 40, actual: 41 })));
    }

    #[test]
    fn test_decode_rejects_oversized_declaration() {
        let mut bytes = encode(&telemetry_header(), &[]).unwrap().to_vec();
        bytes[12..14].copy_from_slice(&2000u16.to_le_bytes());
        assert_eq!(decode(&bytes), Err(CodecError::TooLarge(2000)));
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let mut bytes = encode(&telemetry_header(), b"payload").unwrap().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x80;
        assert_eq!(decode(&bytes), Err(CodecError::ChecksumInvalid));
    }

    #[test]
    fn test_headers_only_crc_ignores_payload() {
        let mut header = telemetry_header();
        header.flags |= PacketFlags::HEADERS_ONLY_CRC;
        let mut bytes = encode(&header, b"abc").unwrap().to_vec();
        bytes[PACKET_HEADER_SIZE] = b'x';
        let packet = decode(&bytes).unwrap();
        assert_eq!(&packet.payload[..], b"xbc");
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; MAX_PACKET_TOTAL_SIZE];
        assert!(matches!(
            encode(&telemetry_header(), &payload),
            Err(CodecError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_chain_iteration() {
        let first = encode(&telemetry_header(), b"one").unwrap();
        let second = encode(&telemetry_header().with_route(43, 7), b"two").unwrap();
        let mut buffer = first.to_vec();
        buffer.extend_from_slice(&second);

        let packets = decode_chain(&buffer).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1].header.vehicle_id_src, 43);
        assert_eq!(&packets[1].payload[..], b"two");
    }

    #[test]
    fn test_chain_stops_at_truncated_packet() {
        let first = encode(&telemetry_header(), b"one").unwrap();
        let mut buffer = first.to_vec();
        buffer.extend_from_slice(&first[..10]);

        let results: Vec<_> = PacketChain::new(&buffer).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(decode_chain(&buffer).is_err());
    }

    fn arb_component() -> impl Strategy<Value = Component> {
        prop_oneof![
            Just(Component::LocalControl),
            Just(Component::Video),
            Just(Component::Telemetry),
            Just(Component::Commands),
            Just(Component::Rc),
            Just(Component::Ruby),
            Just(Component::Audio),
        ]
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            component in arb_component(),
            packet_type in any::<u8>(),
            stream in 0u8..8,
            stream_packet_index in 0u32..0x1000_0000,
            radio_link_packet_index in any::<u16>(),
            src in any::<u32>(),
            dest in any::<u32>(),
            retransmitted in any::<bool>(),
            payload in proptest::collection::vec(any::<u8>(), 0..(MAX_PACKET_TOTAL_SIZE - PACKET_HEADER_SIZE)),
        ) {
            let mut header = PacketHeader::new(component, packet_type, StreamId::new(stream).unwrap())
                .with_route(src, dest);
            header.stream_packet_index = stream_packet_index;
            header.radio_link_packet_index = radio_link_packet_index;
            if retransmitted {
                header.flags |= PacketFlags::RETRANSMITTED;
            }

            let bytes = encode(&header, &payload).unwrap();
            let packet = decode(&bytes).unwrap();
            prop_assert_eq!(packet.header, header);
            prop_assert_eq!(&packet.payload[..], &payload[..]);
        }
    }
}
