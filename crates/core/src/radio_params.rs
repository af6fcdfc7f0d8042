//! Radio link parameters shared by the transport, negotiation and relay code

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Transmit datarate as carried on the wire.
///
/// The raw value is a signed 32-bit integer: `0` lets the radio pick, positive
/// values are legacy rates in bps, negative values are MCS indices (`-1` is MCS 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum DataRate {
    #[default]
    Auto,
    Fixed(u32),
    Mcs(u8),
}

impl DataRate {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => DataRate::Auto,
            r if r > 0 => DataRate::Fixed(r as u32),
            r => DataRate::Mcs((-(r as i64) - 1).clamp(0, u8::MAX as i64) as u8),
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            DataRate::Auto => 0,
            DataRate::Fixed(bps) => bps.min(i32::MAX as u32) as i32,
            DataRate::Mcs(index) => -(index as i32) - 1,
        }
    }
}

impl From<i32> for DataRate {
    fn from(raw: i32) -> Self {
        DataRate::from_raw(raw)
    }
}

impl From<DataRate> for i32 {
    fn from(rate: DataRate) -> Self {
        rate.raw()
    }
}

impl std::fmt::Display for DataRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataRate::Auto => write!(f, "auto"),
            DataRate::Fixed(bps) if bps % 1_000_000 == 0 => write!(f, "{} Mbps", bps / 1_000_000),
            DataRate::Fixed(bps) => write!(f, "{} kbps", bps / 1000),
            DataRate::Mcs(index) => write!(f, "MCS-{}", index),
        }
    }
}

bitflags! {
    /// Radio frame flags applied to outgoing frames.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FrameFlags: u32 {
        const USE_LEGACY_DATARATES = 1 << 0;
        const USE_MCS_DATARATES = 1 << 1;
        const SHORT_GI = 1 << 2;
        const HT20 = 1 << 3;
        const HT40 = 1 << 4;
        const STBC = 1 << 5;
        const LDPC = 1 << 6;
        const APPLY_MCS_FLAGS_ON_VEHICLE = 1 << 7;
        const APPLY_MCS_FLAGS_ON_CONTROLLER = 1 << 8;
    }
}

impl FrameFlags {
    /// Plain HT20 modulation used when MCS extras must not be applied.
    pub fn conservative(self) -> Self {
        if self.contains(FrameFlags::APPLY_MCS_FLAGS_ON_VEHICLE) {
            return self;
        }
        let mut flags = self
            - (FrameFlags::STBC | FrameFlags::LDPC | FrameFlags::SHORT_GI | FrameFlags::HT40);
        flags |= FrameFlags::HT20;
        flags
    }
}

bitflags! {
    /// Capability flags of a radio link or radio interface.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct LinkCapabilities: u32 {
        const CAN_USE_FOR_VIDEO = 1 << 0;
        const CAN_USE_FOR_DATA = 1 << 2;
        const USED_FOR_RELAY = 1 << 4;
        const CAN_RX = 1 << 5;
        const CAN_TX = 1 << 6;
        const DISABLED = 1 << 7;
        const HIGH_CAPACITY = 1 << 9;
    }
}

impl LinkCapabilities {
    /// Enabled and transmit-capable.
    pub fn can_transmit(self) -> bool {
        self.contains(LinkCapabilities::CAN_TX) && !self.contains(LinkCapabilities::DISABLED)
    }

    pub fn is_relay(self) -> bool {
        self.contains(LinkCapabilities::USED_FOR_RELAY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxSettings {
    pub datarate: DataRate,
    pub frame_flags: FrameFlags,
}

impl TxSettings {
    pub fn new(datarate: DataRate, frame_flags: FrameFlags) -> Self {
        Self { datarate, frame_flags }
    }
}

/// The transport's current transmit configuration.
///
/// `base` is what the persistent model says; `temporary` is an override that
/// never reaches the model (used while a negotiation is in progress).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransmitConfig {
    base: TxSettings,
    temporary: Option<TxSettings>,
}

impl TransmitConfig {
    pub fn new(base: TxSettings) -> Self {
        Self { base, temporary: None }
    }

    pub fn active(&self) -> TxSettings {
        self.temporary.unwrap_or(self.base)
    }

    pub fn base(&self) -> TxSettings {
        self.base
    }

    pub fn set_base(&mut self, settings: TxSettings) {
        self.base = settings;
    }

    pub fn temporary(&self) -> Option<TxSettings> {
        self.temporary
    }

    pub fn set_temporary(&mut self, settings: TxSettings) {
        self.temporary = Some(settings);
    }

    pub fn clear_temporary(&mut self) {
        self.temporary = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datarate_raw_mapping() {
        assert_eq!(DataRate::from_raw(0), DataRate::Auto);
        assert_eq!(DataRate::from_raw(18_000_000), DataRate::Fixed(18_000_000));
        assert_eq!(DataRate::from_raw(-1), DataRate::Mcs(0));
        assert_eq!(DataRate::from_raw(-4), DataRate::Mcs(3));
        for raw in [0, 6_000_000, -1, -8] {
            assert_eq!(DataRate::from_raw(raw).raw(), raw);
        }
    }

    #[test]
    fn test_conservative_flags() {
        let flags = FrameFlags::USE_MCS_DATARATES | FrameFlags::HT40 | FrameFlags::LDPC;
        let fallback = flags.conservative();
        assert!(fallback.contains(FrameFlags::HT20 | FrameFlags::USE_MCS_DATARATES));
        assert!(!fallback.intersects(FrameFlags::HT40 | FrameFlags::LDPC));

        let keep = flags | FrameFlags::APPLY_MCS_FLAGS_ON_VEHICLE;
        assert_eq!(keep.conservative(), keep);
    }

    #[test]
    fn test_transmit_config_override() {
        let base = TxSettings::new(DataRate::Fixed(6_000_000), FrameFlags::HT20);
        let mut config = TransmitConfig::new(base);
        let probe = TxSettings::new(DataRate::Mcs(2), FrameFlags::HT20 | FrameFlags::LDPC);

        config.set_temporary(probe);
        assert_eq!(config.active(), probe);
        assert_eq!(config.base(), base);

        config.clear_temporary();
        assert_eq!(config.active(), base);
    }
}
