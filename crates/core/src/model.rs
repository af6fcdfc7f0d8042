//! Vehicle configuration model
//!
//! Snapshot of the configuration the transport consumes: radio links and the
//! interfaces bound to them, relay assignment and FEC profiles. It is passed
//! explicitly to the components that need it and only mutated through the
//! methods below, so every change can be persisted and announced.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::radio_params::{DataRate, FrameFlags, LinkCapabilities, TxSettings};
use crate::types::{StreamId, VehicleId};

pub const MAX_DATA_FRAGMENTS: u8 = 32;
pub const MAX_PARITY_FRAGMENTS: u8 = 32;
pub const MAX_TOTAL_FRAGMENTS: u8 = 64;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no radio links configured")]
    NoRadioLinks,

    #[error("radio interface {interface} is bound to unknown link {link}")]
    UnknownLink { interface: usize, link: u8 },

    #[error("relay link {0} does not exist")]
    InvalidRelayLink(u8),

    #[error("every radio link is used for relaying")]
    OnlyRelayLinks,

    #[error("invalid FEC profile {data}/{total}")]
    InvalidFecProfile { data: u8, total: u8 },

    #[error("model file io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("model file parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("model serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Erasure-coding parameters for one stream: `data` (K) out of `total` (N) fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawFecProfile", into = "RawFecProfile")]
pub struct FecProfile {
    data: u8,
    total: u8,
}

#[derive(Serialize, Deserialize)]
struct RawFecProfile {
    data: u8,
    total: u8,
}

impl FecProfile {
    pub fn new(data: u8, total: u8) -> Result<Self, ModelError> {
        let valid = data >= 1
            && data <= MAX_DATA_FRAGMENTS
            && total >= data
            && total <= MAX_TOTAL_FRAGMENTS
            && total - data <= MAX_PARITY_FRAGMENTS;
        if !valid {
            return Err(ModelError::InvalidFecProfile { data, total });
        }
        Ok(Self { data, total })
    }

    pub fn data_fragments(&self) -> usize {
        self.data as usize
    }

    pub fn total_fragments(&self) -> usize {
        self.total as usize
    }

    pub fn parity_fragments(&self) -> usize {
        (self.total - self.data) as usize
    }

    pub fn has_parity(&self) -> bool {
        self.total > self.data
    }
}

impl TryFrom<RawFecProfile> for FecProfile {
    type Error = ModelError;

    fn try_from(raw: RawFecProfile) -> Result<Self, Self::Error> {
        FecProfile::new(raw.data, raw.total)
    }
}

impl From<FecProfile> for RawFecProfile {
    fn from(profile: FecProfile) -> Self {
        RawFecProfile { data: profile.data, total: profile.total }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioLinkParams {
    pub capabilities: LinkCapabilities,
    /// Datarate for traffic sent towards the controller.
    pub downlink_datarate: DataRate,
    /// Datarate for traffic sent towards a vehicle (the relayed one on a relay link).
    pub uplink_datarate: DataRate,
    pub frame_flags: FrameFlags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioInterfaceParams {
    pub link_id: u8,
    pub capabilities: LinkCapabilities,
    pub current_frame_flags: FrameFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayParams {
    /// Remote vehicle whose traffic is forwarded; `0` disables relaying.
    pub relayed_vehicle_id: VehicleId,
    pub relay_link_id: Option<u8>,
}

impl RelayParams {
    pub fn is_active(&self) -> bool {
        self.relayed_vehicle_id != 0 && self.relay_link_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamFecProfile {
    pub stream: StreamId,
    pub profile: FecProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleModel {
    pub vehicle_id: VehicleId,
    pub controller_id: VehicleId,
    pub rc_enabled: bool,
    #[serde(default)]
    pub has_negotiated_links: bool,
    pub radio_links: Vec<RadioLinkParams>,
    pub radio_interfaces: Vec<RadioInterfaceParams>,
    #[serde(default)]
    pub relay: RelayParams,
    #[serde(default)]
    pub fec_profiles: Vec<StreamFecProfile>,
}

impl VehicleModel {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.radio_links.is_empty() {
            return Err(ModelError::NoRadioLinks);
        }
        for (interface, params) in self.radio_interfaces.iter().enumerate() {
            if params.link_id as usize >= self.radio_links.len() {
                return Err(ModelError::UnknownLink { interface, link: params.link_id });
            }
        }
        if let Some(link) = self.relay.relay_link_id {
            if link as usize >= self.radio_links.len() {
                return Err(ModelError::InvalidRelayLink(link));
            }
        }
        Ok(())
    }

    /// Datarate and frame flags of the first radio link.
    /// Settings of the first link that is not relaying, or of the first link.
    pub fn primary_tx_settings(&self) -> Result<TxSettings, ModelError> {
        let link = self
            .radio_links
            .iter()
            .find(|link| !link.capabilities.is_relay())
            .or(self.radio_links.first())
            .ok_or(ModelError::NoRadioLinks)?;
        Ok(TxSettings::new(link.downlink_datarate, link.frame_flags))
    }

    pub fn fec_profile(&self, stream: StreamId) -> Option<FecProfile> {
        self.fec_profiles
            .iter()
            .find(|entry| entry.stream == stream)
            .map(|entry| entry.profile)
    }

    /// Stores the outcome of a radio link negotiation.
    ///
    /// Only controller-facing links change; a relay link keeps the datarates of its relay assignment.
    pub fn apply_negotiated(&mut self, settings: TxSettings) -> Result<(), ModelError> {
        if self.radio_links.is_empty() {
            return Err(ModelError::NoRadioLinks);
        }
        let mut links = self.radio_links.iter_mut().filter(|link| !link.capabilities.is_relay());
        let primary = links.next().ok_or(ModelError::OnlyRelayLinks)?;
        primary.frame_flags = settings.frame_flags;
        for link in std::iter::once(primary).chain(links) {
            link.downlink_datarate = settings.datarate;
            link.uplink_datarate = settings.datarate;
        }
        self.has_negotiated_links = true;
        Ok(())
    }

    /// Marks `link_id` as the relay link for `vehicle_id`, or clears relaying.
    pub fn set_relay(&mut self, assignment: Option<(VehicleId, u8)>) -> Result<(), ModelError> {
        if let Some((_, link_id)) = assignment {
            if link_id as usize >= self.radio_links.len() {
                return Err(ModelError::InvalidRelayLink(link_id));
            }
        }
        for link in &mut self.radio_links {
            link.capabilities.remove(LinkCapabilities::USED_FOR_RELAY);
        }
        match assignment {
            Some((vehicle_id, link_id)) => {
                self.radio_links[link_id as usize]
                    .capabilities
                    .insert(LinkCapabilities::USED_FOR_RELAY);
                self.relay = RelayParams {
                    relayed_vehicle_id: vehicle_id,
                    relay_link_id: Some(link_id),
                };
            }
            None => self.relay = RelayParams::default(),
        }
        Ok(())
    }
}

/// Durable storage for the vehicle model.
pub trait ModelStore {
    fn load(&self) -> Result<VehicleModel, ModelError>;
    fn save(&mut self, model: &VehicleModel) -> Result<(), ModelError>;
}

pub struct TomlModelStore {
    path: PathBuf,
}

impl TomlModelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ModelStore for TomlModelStore {
    fn load(&self) -> Result<VehicleModel, ModelError> {
        let contents = fs::read_to_string(&self.path)?;
        let model: VehicleModel = toml::from_str(&contents)?;
        model.validate()?;
        Ok(model)
    }

    fn save(&mut self, model: &VehicleModel) -> Result<(), ModelError> {
        let contents = toml::to_string_pretty(model)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        info!("Saved vehicle model to {}", self.path.display());
        Ok(())
    }
}

/// In-memory store, counts saves.
#[derive(Debug, Default)]
pub struct MemoryModelStore {
    pub saved: Option<VehicleModel>,
    pub save_count: usize,
}

impl ModelStore for MemoryModelStore {
    fn load(&self) -> Result<VehicleModel, ModelError> {
        self.saved
            .clone()
            .ok_or_else(|| ModelError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)))
    }

    fn save(&mut self, model: &VehicleModel) -> Result<(), ModelError> {
        self.saved = Some(model.clone());
        self.save_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_link_model() -> VehicleModel {
        let link = RadioLinkParams {
            capabilities: LinkCapabilities::CAN_TX | LinkCapabilities::CAN_RX,
            downlink_datarate: DataRate::Fixed(12_000_000),
            uplink_datarate: DataRate::Fixed(6_000_000),
            frame_flags: FrameFlags::USE_LEGACY_DATARATES | FrameFlags::HT20,
        };
        VehicleModel {
            vehicle_id: 1001,
            controller_id: 2002,
            rc_enabled: false,
            radio_links: vec![link.clone(), link],
            radio_interfaces: vec![RadioInterfaceParams {
                link_id: 1,
                capabilities: LinkCapabilities::CAN_TX,
                current_frame_flags: FrameFlags::HT20,
            }],
            relay: RelayParams::default(),
            fec_profiles: vec![StreamFecProfile {
                stream: StreamId::VIDEO_1,
                profile: FecProfile::new(8, 12).unwrap(),
            }],
            has_negotiated_links: false,
        }
    }

    #[test]
    fn test_fec_profile_bounds() {
        assert!(FecProfile::new(8, 12).is_ok());
        assert!(FecProfile::new(4, 4).is_ok());
        assert!(FecProfile::new(0, 4).is_err());
        assert!(FecProfile::new(8, 6).is_err());
        assert!(FecProfile::new(32, 65).is_err());
        assert!(FecProfile::new(4, 40).is_err());
    }

    #[test]
    fn test_validate() {
        let mut model = two_link_model();
        assert!(model.validate().is_ok());

        model.radio_interfaces[0].link_id = 5;
        assert!(matches!(model.validate(), Err(ModelError::UnknownLink { interface: 0, link: 5 })));

        model.radio_links.clear();
        assert!(matches!(model.validate(), Err(ModelError::NoRadioLinks)));
    }

    #[test]
    fn test_apply_negotiated() {
        let mut model = two_link_model();
        let settings = TxSettings::new(DataRate::Mcs(3), FrameFlags::USE_MCS_DATARATES | FrameFlags::LDPC);
        model.apply_negotiated(settings).unwrap();

        assert!(model.has_negotiated_links);
        assert_eq!(model.primary_tx_settings().unwrap(), settings);
        assert!(model.radio_links.iter().all(|l| l.uplink_datarate == DataRate::Mcs(3)));
    }

    #[test]
    fn test_apply_negotiated_leaves_relay_link_alone() {
        let mut model = two_link_model();
        model.radio_links[1].uplink_datarate = DataRate::Fixed(18_000_000);
        model.set_relay(Some((555, 1))).unwrap();

        let settings = TxSettings::new(DataRate::Mcs(7), FrameFlags::USE_MCS_DATARATES);
        model.apply_negotiated(settings).unwrap();

        assert_eq!(model.radio_links[0].uplink_datarate, DataRate::Mcs(7));
        assert_eq!(model.radio_links[0].downlink_datarate, DataRate::Mcs(7));
        assert_eq!(model.radio_links[1].uplink_datarate, DataRate::Fixed(18_000_000));
        assert_eq!(model.radio_links[1].downlink_datarate, DataRate::Fixed(12_000_000));
        assert_eq!(model.radio_links[1].frame_flags, FrameFlags::USE_LEGACY_DATARATES | FrameFlags::HT20);
        assert_eq!(model.primary_tx_settings().unwrap(), settings);
    }

    #[test]
    fn test_apply_negotiated_needs_a_controller_link() {
        let mut model = two_link_model();
        model.radio_links.truncate(1);
        model.set_relay(Some((555, 0))).unwrap();
        let settings = TxSettings::new(DataRate::Mcs(2), FrameFlags::USE_MCS_DATARATES);
        assert!(matches!(model.apply_negotiated(settings), Err(ModelError::OnlyRelayLinks)));
        assert!(!model.has_negotiated_links);
    }

    #[test]
    fn test_set_relay_marks_single_link() {
        let mut model = two_link_model();
        model.set_relay(Some((555, 1))).unwrap();
        assert!(model.relay.is_active());
        assert!(model.radio_links[1].capabilities.is_relay());
        assert!(!model.radio_links[0].capabilities.is_relay());

        model.set_relay(None).unwrap();
        assert!(!model.relay.is_active());
        assert!(!model.radio_links[1].capabilities.is_relay());

        assert!(matches!(model.set_relay(Some((555, 9))), Err(ModelError::InvalidRelayLink(9))));
    }

    #[test]
    fn test_toml_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("fpvlink-model-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let mut store = TomlModelStore::new(dir.join("model.toml"));

        let model = two_link_model();
        store.save(&model).unwrap();
        assert_eq!(store.load().unwrap(), model);

        fs::remove_dir_all(&dir).unwrap();
    }
}
