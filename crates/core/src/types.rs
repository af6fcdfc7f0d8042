use serde::{Deserialize, Serialize};

pub type VehicleId = u32;

pub const MAX_PACKET_TOTAL_SIZE: usize = 1500;
pub const MAX_PACKET_PAYLOAD: usize = 1250;
pub const PACKET_HEADER_SIZE: usize = 24;

pub const MAX_RADIO_STREAMS: u8 = 8;
pub const MAX_VIDEO_STREAMS: u8 = 4;

pub const BROADCAST_VEHICLE_ID: VehicleId = 1_111_111_111;

/// Protocol version carried in the low byte of the extended flags.
pub const PROTOCOL_VERSION: u8 = (10 << 4) | 4;

pub mod packet_types {
    pub const RUBY_PING_CLOCK: u8 = 3;
    pub const RUBY_PING_CLOCK_REPLY: u8 = 4;
    pub const RUBY_RADIO_CONFIG_UPDATED: u8 = 9;
    pub const COMMAND: u8 = 11;
    pub const COMMAND_RESPONSE: u8 = 12;
    pub const RUBY_ALARM: u8 = 15;
    pub const VIDEO_DATA: u8 = 22;
    pub const RC_FULL_FRAME: u8 = 25;
    pub const NEGOTIATE_RADIO_LINKS: u8 = 72;

    pub const LOCAL_CONTROL_MODEL_CHANGED: u8 = 151;
    pub const LOCAL_CONTROL_RELAY_ALARM: u8 = 152;
    pub const LOCAL_CONTROL_VIDEO_BLOCK: u8 = 153;
}

/// Logical stream selected by the high 4 bits of the stream packet index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(u8);

impl StreamId {
    pub const DATA: StreamId = StreamId(0);
    pub const TELEMETRY: StreamId = StreamId(1);
    pub const AUDIO: StreamId = StreamId(2);
    pub const DATA2: StreamId = StreamId(3);
    pub const VIDEO_1: StreamId = StreamId(4);

    pub fn new(id: u8) -> Option<Self> {
        (id < MAX_RADIO_STREAMS).then_some(StreamId(id))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_video(self) -> bool {
        self.0 >= Self::VIDEO_1.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Target module encoded in the low 3 bits of the packet flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Component {
    LocalControl = 0,
    Video = 1,
    Telemetry = 2,
    Commands = 3,
    Rc = 4,
    Ruby = 5,
    Audio = 6,
}

impl Component {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0b0111 {
            0 => Some(Component::LocalControl),
            1 => Some(Component::Video),
            2 => Some(Component::Telemetry),
            3 => Some(Component::Commands),
            4 => Some(Component::Rc),
            5 => Some(Component::Ruby),
            6 => Some(Component::Audio),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_bounds() {
        assert_eq!(StreamId::new(7).map(StreamId::get), Some(7));
        assert!(StreamId::new(MAX_RADIO_STREAMS).is_none());
        assert!(StreamId::VIDEO_1.is_video());
        assert!(!StreamId::TELEMETRY.is_video());
    }

    #[test]
    fn test_component_from_flags() {
        assert_eq!(Component::from_bits(0b1000_0011), Some(Component::Commands));
        assert_eq!(Component::from_bits(7), None);
    }
}
