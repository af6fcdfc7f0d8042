//! Forwarding of a relayed vehicle's traffic between the controller link and the relay link
//!
//! Only chains whose every packet declares the relayed vehicle id are forwarded:
//! the source id towards the controller, the destination id towards the relayed
//! vehicle. Anything else is routine filtering, not an error.

use bytes::Bytes;
use log::{debug, trace, warn};
use thiserror::Error;

use fpvlink_core::{decode_chain, CodecError, Packet, StreamId, TxSettings, VehicleId, VehicleModel};

use crate::interface::{RadioInterfaces, RadioPort};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("no radio interface could send the relayed packets")]
    NoInterfaceAvailable,

    #[error("malformed relayed packet: {0}")]
    Malformed(#[from] CodecError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Filtered,
    Sent { links: Vec<u8> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub to_controller: u64,
    pub to_relayed_vehicle: u64,
    pub filtered: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToController,
    ToRelayedVehicle,
}

#[derive(Debug, Default)]
pub struct RelayForwarder {
    stats: RelayStats,
}

impl RelayForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Sends packets received from the relayed vehicle on to the controller.
    pub fn forward_to_controller(
        &mut self,
        buffer: &[u8],
        model: &VehicleModel,
        interfaces: &mut RadioInterfaces,
    ) -> Result<RelayOutcome, RelayError> {
        self.forward(Direction::ToController, buffer, model, interfaces)
    }

    /// Sends packets addressed to the relayed vehicle out on the relay link.
    pub fn forward_to_relayed_vehicle(
        &mut self,
        buffer: &[u8],
        model: &VehicleModel,
        interfaces: &mut RadioInterfaces,
    ) -> Result<RelayOutcome, RelayError> {
        self.forward(Direction::ToRelayedVehicle, buffer, model, interfaces)
    }

    fn forward(
        &mut self,
        direction: Direction,
        buffer: &[u8],
        model: &VehicleModel,
        interfaces: &mut RadioInterfaces,
    ) -> Result<RelayOutcome, RelayError> {
        if !model.relay.is_active() {
            self.stats.filtered += 1;
            return Ok(RelayOutcome::Filtered);
        }
        let relayed = model.relay.relayed_vehicle_id;
        let packets = decode_chain(buffer).inspect_err(|e| {
            debug!("[RelayTX] Dropping malformed chain: {}", e);
            self.stats.filtered += 1;
        })?;
        if packets.is_empty() || !packets.iter().all(|p| relevant_id(direction, p) == relayed) {
            trace!("[RelayTX] Chain is not for relayed vehicle {}, skipping", relayed);
            self.stats.filtered += 1;
            return Ok(RelayOutcome::Filtered);
        }

        let streams: Vec<(StreamId, usize)> =
            packets.iter().map(|p| (p.header.stream, p.total_length())).collect();
        let payload = Bytes::copy_from_slice(buffer);
        let port = match direction {
            Direction::ToController => RadioPort::RouterDownlink,
            Direction::ToRelayedVehicle => RadioPort::RouterUplink,
        };

        let links = interfaces.transmit_on_links(&model.radio_links, port, &payload, &streams, |_, link, interface| {
            let datarate = match direction {
                Direction::ToController if !link.capabilities.is_relay() => link.downlink_datarate,
                Direction::ToRelayedVehicle if link.capabilities.is_relay() => link.uplink_datarate,
                _ => return None,
            };
            Some(TxSettings::new(datarate, interface.current_frame_flags.conservative()))
        });

        if links.is_empty() {
            self.stats.failed += 1;
            warn!(
                "[RelayTX] No radio interface could send {} relayed packets ({:?}) for vehicle {}",
                packets.len(),
                direction,
                relayed
            );
            return Err(RelayError::NoInterfaceAvailable);
        }
        match direction {
            Direction::ToController => self.stats.to_controller += 1,
            Direction::ToRelayedVehicle => self.stats.to_relayed_vehicle += 1,
        }
        Ok(RelayOutcome::Sent { links })
    }
}

fn relevant_id(direction: Direction, packet: &Packet) -> VehicleId {
    match direction {
        Direction::ToController => packet.header.vehicle_id_src,
        Direction::ToRelayedVehicle => packet.header.vehicle_id_dest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::RadioInterface;
    use crate::simulated::{LinkConditions, SimulatedRadio, SimulatedStats};
    use fpvlink_core::model::{RadioInterfaceParams, RadioLinkParams, RelayParams};
    use fpvlink_core::{encode, Component, DataRate, FrameFlags, LinkCapabilities, PacketHeader};
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    const RELAYED: VehicleId = 5555;
    const CONTROLLER: VehicleId = 1000;

    fn model() -> VehicleModel {
        let caps = LinkCapabilities::CAN_TX | LinkCapabilities::CAN_RX;
        let link = |downlink, uplink| RadioLinkParams {
            capabilities: caps,
            downlink_datarate: DataRate::Fixed(downlink),
            uplink_datarate: DataRate::Fixed(uplink),
            frame_flags: FrameFlags::HT20,
        };
        let mut model = VehicleModel {
            vehicle_id: 42,
            controller_id: CONTROLLER,
            rc_enabled: false,
            has_negotiated_links: false,
            radio_links: vec![link(6_000_000, 9_000_000), link(12_000_000, 18_000_000)],
            radio_interfaces: vec![
                RadioInterfaceParams {
                    link_id: 0,
                    capabilities: caps,
                    current_frame_flags: FrameFlags::USE_MCS_DATARATES | FrameFlags::HT40 | FrameFlags::LDPC,
                },
                RadioInterfaceParams { link_id: 1, capabilities: caps, current_frame_flags: FrameFlags::HT20 },
            ],
            relay: RelayParams::default(),
            fec_profiles: Vec::new(),
        };
        model.set_relay(Some((RELAYED, 1))).unwrap();
        model
    }

    struct Rig {
        interfaces: RadioInterfaces,
        peers: Vec<SimulatedRadio>,
        stats: Vec<Arc<Mutex<SimulatedStats>>>,
    }

    fn rig(model: &VehicleModel) -> Rig {
        let mut rig = Rig { interfaces: RadioInterfaces::new(), peers: Vec::new(), stats: Vec::new() };
        for (i, params) in model.radio_interfaces.iter().enumerate() {
            let (radio, peer) = SimulatedRadio::pair(&format!("wlan{}", i), LinkConditions::perfect());
            rig.stats.push(radio.stats_handle());
            rig.interfaces.add(params.clone(), Box::new(radio));
            rig.peers.push(peer);
        }
        rig
    }

    fn packet(src: VehicleId, dest: VehicleId) -> Vec<u8> {
        let header = PacketHeader::new(Component::Telemetry, 30, StreamId::TELEMETRY).with_route(src, dest);
        encode(&header, b"relayed telemetry").unwrap().to_vec()
    }

    #[test]
    fn test_forward_to_controller_uses_non_relay_links() {
        let model = model();
        let mut rig = rig(&model);
        let mut relay = RelayForwarder::new();
        let chain = [packet(RELAYED, CONTROLLER), packet(RELAYED, CONTROLLER)].concat();

        let outcome = relay.forward_to_controller(&chain, &model, &mut rig.interfaces).unwrap();
        assert_eq!(outcome, RelayOutcome::Sent { links: vec![0] });
        assert_eq!(rig.peers[0].try_receive().unwrap(), Some(chain.clone()));
        assert_eq!(rig.peers[1].try_receive().unwrap(), None);

        let sent = rig.stats[0].lock().unwrap().clone();
        assert_eq!(sent.last_port, Some(RadioPort::RouterDownlink));
        let settings = sent.last_settings.unwrap();
        assert_eq!(settings.datarate, DataRate::Fixed(6_000_000));
        // interface flags lack APPLY_MCS_FLAGS_ON_VEHICLE: plain HT20
        assert!(settings.frame_flags.contains(FrameFlags::HT20));
        assert!(!settings.frame_flags.intersects(FrameFlags::HT40 | FrameFlags::LDPC));

        assert_eq!(rig.interfaces.accounting().stream(StreamId::TELEMETRY).packets, 2);
        assert_eq!(relay.stats().to_controller, 1);
    }

    #[test]
    fn test_forward_to_relayed_vehicle_uses_relay_link() {
        let model = model();
        let mut rig = rig(&model);
        let mut relay = RelayForwarder::new();
        let chain = packet(CONTROLLER, RELAYED);

        let outcome = relay.forward_to_relayed_vehicle(&chain, &model, &mut rig.interfaces).unwrap();
        assert_eq!(outcome, RelayOutcome::Sent { links: vec![1] });
        assert_eq!(rig.peers[0].try_receive().unwrap(), None);
        assert_eq!(rig.peers[1].try_receive().unwrap(), Some(chain));

        let sent = rig.stats[1].lock().unwrap().clone();
        assert_eq!(sent.last_port, Some(RadioPort::RouterUplink));
        assert_eq!(sent.last_settings.unwrap().datarate, DataRate::Fixed(18_000_000));
    }

    #[test]
    fn test_filters_other_vehicles() {
        let model = model();
        let mut rig = rig(&model);
        let mut relay = RelayForwarder::new();

        let other = packet(777, CONTROLLER);
        assert_eq!(relay.forward_to_controller(&other, &model, &mut rig.interfaces), Ok(RelayOutcome::Filtered));
        let mixed = [packet(RELAYED, CONTROLLER), packet(777, CONTROLLER)].concat();
        assert_eq!(relay.forward_to_controller(&mixed, &model, &mut rig.interfaces), Ok(RelayOutcome::Filtered));
        assert_eq!(relay.stats().filtered, 2);
        assert_eq!(rig.peers[0].try_receive().unwrap(), None);
    }

    #[test]
    fn test_inactive_relay_forwards_nothing() {
        let mut model = model();
        model.set_relay(None).unwrap();
        let mut rig = rig(&model);
        let outcome = RelayForwarder::new()
            .forward_to_controller(&packet(RELAYED, CONTROLLER), &model, &mut rig.interfaces)
            .unwrap();
        assert_eq!(outcome, RelayOutcome::Filtered);
    }

    #[test]
    fn test_malformed_chain() {
        let model = model();
        let mut rig = rig(&model);
        let mut chain = packet(RELAYED, CONTROLLER);
        chain[10] ^= 0x40;
        assert_eq!(
            RelayForwarder::new().forward_to_controller(&chain, &model, &mut rig.interfaces),
            Err(RelayError::Malformed(CodecError::ChecksumInvalid))
        );
    }

    #[test]
    fn test_no_interface_available() {
        let mut model = model();
        model.radio_links[1].capabilities.insert(LinkCapabilities::DISABLED);
        let mut rig = rig(&model);
        let mut relay = RelayForwarder::new();

        assert_eq!(
            relay.forward_to_relayed_vehicle(&packet(CONTROLLER, RELAYED), &model, &mut rig.interfaces),
            Err(RelayError::NoInterfaceAvailable)
        );
        assert_eq!(relay.stats().failed, 1);
    }

    proptest! {
        #[test]
        fn prop_never_relays_foreign_packets(
            routes in proptest::collection::vec((prop_oneof![Just(RELAYED), 1u32..10_000], 1u32..10_000), 1..6),
            to_controller in any::<bool>(),
        ) {
            let model = model();
            let mut rig = rig(&model);
            let chain: Vec<u8> = routes
                .iter()
                .flat_map(|&(relevant, other)| {
                    if to_controller { packet(relevant, other) } else { packet(other, relevant) }
                })
                .collect();
            let all_relayed = routes.iter().all(|&(relevant, _)| relevant == RELAYED);

            let mut relay = RelayForwarder::new();
            let outcome = if to_controller {
                relay.forward_to_controller(&chain, &model, &mut rig.interfaces)
            } else {
                relay.forward_to_relayed_vehicle(&chain, &model, &mut rig.interfaces)
            };

            let transmitted: u64 = rig.stats.iter().map(|s| s.lock().unwrap().frames_sent).sum();
            if all_relayed {
                let sent = matches!(outcome, Ok(RelayOutcome::Sent { .. }));
                prop_assert!(sent, "expected a relayed frame, got {:?}", outcome);
                prop_assert_eq!(transmitted, 1);
            } else {
                prop_assert_eq!(outcome, Ok(RelayOutcome::Filtered));
                prop_assert_eq!(transmitted, 0);
            }
        }
    }
}
