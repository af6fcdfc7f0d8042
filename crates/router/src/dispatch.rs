//! The router's tick: radio in, IPC out, IPC in, radio out

use std::future::Future;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, error, info, trace, warn};
use thiserror::Error;
use tokio::time::MissedTickBehavior;

use fpvlink_core::model::ModelError;
use fpvlink_core::types::packet_types;
use fpvlink_core::{
    Component, ModelStore, Packet, PacketChain, PacketHeader, StreamId, TransmitConfig, VehicleId,
    VehicleModel,
};
use fpvlink_ipc::{ChannelId, ChannelType, IpcError, IpcHub, Transport};
use fpvlink_radio::negotiate::{echo_packet, Direction};
use fpvlink_radio::relay::RelayStats;
use fpvlink_radio::{
    FecError, FecReconstructor, NegotiationEvent, NegotiationMessage, Negotiator, PacketQueue,
    RadioInterfaces, RadioPort, RecoveredBlock, RelayError, RelayForwarder, RelayOutcome,
};

use crate::config::{Role, RouterConfig};
use crate::stats::ProcessStats;

/// Payload byte of a `LOCAL_CONTROL_MODEL_CHANGED` packet sent after a negotiation commit.
pub const MODEL_CHANGE_RADIO_DATARATES: u8 = 1;

/// Bytes in front of the fragment in a `LOCAL_CONTROL_VIDEO_BLOCK` payload: the block index, u32 LE.
pub const VIDEO_BLOCK_PREFIX_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Invalid vehicle model: {0}")]
    Model(#[from] ModelError),

    #[error("Invalid FEC profile: {0}")]
    Fec(#[from] FecError),

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

/// What one tick did, mostly for tests and debug logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub radio_frames: usize,
    pub radio_packets: usize,
    pub malformed: usize,
    pub ipc_messages: usize,
    pub recovered_blocks: usize,
    pub relayed: usize,
    pub frames_sent: usize,
}

#[derive(Debug, Clone, Copy)]
struct Outputs {
    central: ChannelId,
    telemetry: ChannelId,
    commands: ChannelId,
    rc: ChannelId,
}

const INPUT_CHANNELS: [ChannelType; 4] = [
    ChannelType::CentralToRouter,
    ChannelType::TelemetryToRouter,
    ChannelType::CommandsToRouter,
    ChannelType::RcToRouter,
];

pub struct Router<T: Transport, S: ModelStore> {
    config: RouterConfig,
    model: VehicleModel,
    store: S,
    hub: IpcHub<T>,
    interfaces: RadioInterfaces,
    fec: FecReconstructor,
    negotiator: Negotiator,
    relay: RelayForwarder,
    tx_config: TransmitConfig,
    outbound: PacketQueue,
    stats: ProcessStats,
    outputs: Option<Outputs>,
    inputs: Vec<ChannelId>,
    local_packet_index: u32,
}

impl<T: Transport, S: ModelStore> Router<T, S> {
    pub fn new(
        config: RouterConfig,
        model: VehicleModel,
        store: S,
        hub: IpcHub<T>,
        interfaces: RadioInterfaces,
    ) -> Result<Self, RouterError> {
        model.validate()?;
        let tx_config = TransmitConfig::new(model.primary_tx_settings()?);

        let mut fec = FecReconstructor::new(config.fec);
        for entry in &model.fec_profiles {
            fec.set_profile(entry.stream, entry.profile)?;
        }

        Ok(Self {
            negotiator: Negotiator::new(config.negotiation),
            outbound: PacketQueue::new(config.outbound_queue_capacity),
            config,
            model,
            store,
            hub,
            interfaces,
            fec,
            relay: RelayForwarder::new(),
            tx_config,
            stats: ProcessStats::new(),
            outputs: None,
            inputs: Vec::new(),
            local_packet_index: 0,
        })
    }

    /// Opens every IPC endpoint the router uses.
    pub fn open_channels(&mut self) -> Result<(), RouterError> {
        let outputs = Outputs {
            central: self.hub.open_write_endpoint(ChannelType::RouterToCentral)?,
            telemetry: self.hub.open_write_endpoint(ChannelType::RouterToTelemetry)?,
            commands: self.hub.open_write_endpoint(ChannelType::RouterToCommands)?,
            rc: self.hub.open_write_endpoint(ChannelType::RouterToRc)?,
        };
        let mut inputs = Vec::with_capacity(INPUT_CHANNELS.len());
        for channel in INPUT_CHANNELS {
            inputs.push(self.hub.open_read_endpoint(channel)?);
        }
        self.outputs = Some(outputs);
        self.inputs = inputs;
        info!("[Router] Opened {} IPC channels", self.hub.open_channels());
        Ok(())
    }

    pub fn model(&self) -> &VehicleModel {
        &self.model
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn tx_config(&self) -> TransmitConfig {
        self.tx_config
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub fn fec(&self) -> &FecReconstructor {
        &self.fec
    }

    pub fn relay_stats(&self) -> RelayStats {
        self.relay.stats()
    }

    pub fn interfaces(&self) -> &RadioInterfaces {
        &self.interfaces
    }

    pub fn hub(&self) -> &IpcHub<T> {
        &self.hub
    }

    pub fn outbound(&self) -> &PacketQueue {
        &self.outbound
    }

    /// Handle for the watchdog; clones share the timestamps.
    pub fn stats(&self) -> ProcessStats {
        self.stats.clone()
    }

    /// Runs ticks until `shutdown` completes, then closes every channel.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!("[Router] Running as {:?}, tick every {:?}", self.config.role, self.config.tick_interval());
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    let report = self.tick(Instant::now()).await;
                    if report != TickReport::default() {
                        trace!("[Router] {:?}", report);
                    }
                }
            }
        }
        info!("[Router] Shutting down");
        self.hub.close_all();
    }

    pub async fn tick(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        self.drain_radio(now, &mut report).await;

        let recovered = self.fec.try_emit_all();
        report.recovered_blocks = recovered.len();
        for block in recovered {
            self.deliver_block(&block).await;
        }

        self.drain_ipc(&mut report).await;

        if let Some(event) = self.negotiator.poll_timeout(now, &mut self.tx_config) {
            self.on_negotiation_event(event).await;
        }

        report.frames_sent = self.flush_outbound();
        self.stats.tick();
        report
    }

    async fn drain_radio(&mut self, now: Instant, report: &mut TickReport) {
        let frames = self.interfaces.receive_all();
        if frames.is_empty() {
            return;
        }
        self.stats.radio_rx();
        report.radio_frames += frames.len();

        for (link_id, frame) in frames {
            let from_relay_link = self
                .model
                .radio_links
                .get(link_id as usize)
                .is_some_and(|link| link.capabilities.is_relay());
            if from_relay_link {
                self.relay_frame(&frame, true, report).await;
                continue;
            }

            for result in PacketChain::new(&frame) {
                match result {
                    Ok(packet) => {
                        report.radio_packets += 1;
                        self.route_radio_packet(packet, now, report).await;
                    }
                    Err(e) => {
                        debug!("[Router] Dropping rest of radio frame from link {}: {}", link_id, e);
                        report.malformed += 1;
                    }
                }
            }
        }
    }

    async fn route_radio_packet(&mut self, packet: Packet, now: Instant, report: &mut TickReport) {
        let header = &packet.header;
        if self.is_for_relayed_vehicle(header.vehicle_id_dest) {
            match packet.encode() {
                Ok(bytes) => self.relay_frame(&bytes, false, report).await,
                Err(e) => warn!("[Router] Can't re-encode packet for relayed vehicle: {}", e),
            }
            return;
        }

        match header.component {
            Component::Ruby if header.packet_type == packet_types::NEGOTIATE_RADIO_LINKS => {
                self.on_negotiation_packet(&packet, now).await;
            }
            Component::Video => {
                if let Err(e) = self.fec.ingest_payload(header.stream, &packet.payload) {
                    debug!("[Router] Rejected video fragment on stream {}: {}", header.stream, e);
                }
            }
            Component::Telemetry => self.forward_to_process(&packet, |o| o.telemetry).await,
            Component::Commands => self.forward_to_process(&packet, |o| o.commands).await,
            Component::Rc => self.forward_to_process(&packet, |o| o.rc).await,
            _ => self.forward_to_process(&packet, |o| o.central).await,
        }
    }

    fn is_for_relayed_vehicle(&self, vehicle_id: VehicleId) -> bool {
        self.config.role == Role::Vehicle
            && self.model.relay.is_active()
            && vehicle_id == self.model.relay.relayed_vehicle_id
    }

    async fn relay_frame(&mut self, frame: &[u8], to_controller: bool, report: &mut TickReport) {
        let result = if to_controller {
            self.relay.forward_to_controller(frame, &self.model, &mut self.interfaces)
        } else {
            self.relay.forward_to_relayed_vehicle(frame, &self.model, &mut self.interfaces)
        };
        match result {
            Ok(RelayOutcome::Sent { links }) => {
                trace!("[Router] Relayed {} bytes on links {:?}", frame.len(), links);
                report.relayed += 1;
                self.stats.radio_tx();
            }
            Ok(RelayOutcome::Filtered) => {}
            Err(RelayError::Malformed(e)) => {
                debug!("[Router] Malformed relay frame: {}", e);
                report.malformed += 1;
            }
            Err(e @ RelayError::NoInterfaceAvailable) => {
                warn!("[Router] Relay failed: {}", e);
                self.stats.alarm();
                let alarm = self
                    .local_control_packet(packet_types::LOCAL_CONTROL_RELAY_ALARM, &[u8::from(to_controller)]);
                self.send_local(alarm, |o| o.central).await;
            }
        }
    }

    async fn on_negotiation_packet(&mut self, packet: &Packet, now: Instant) {
        let message = match NegotiationMessage::decode(&packet.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("[NegotiateRadioLink] Invalid negotiation packet: {}", e);
                return;
            }
        };

        match (self.config.role, message.direction) {
            (Role::Vehicle, Direction::Request) => {
                let event = self.negotiator.handle(message.command, now, &mut self.tx_config);
                match echo_packet(&packet.header, &message, self.model.vehicle_id) {
                    Ok(echo) => self.outbound.push(echo),
                    Err(e) => warn!("[NegotiateRadioLink] Can't build confirmation: {}", e),
                }
                self.on_negotiation_event(event).await;
            }
            (Role::Controller, Direction::Confirmation) => {
                self.forward_to_process(packet, |o| o.central).await;
            }
            (role, direction) => {
                debug!("[NegotiateRadioLink] Ignoring {:?} received as {:?}", direction, role);
            }
        }
    }

    async fn on_negotiation_event(&mut self, event: NegotiationEvent) {
        match event {
            NegotiationEvent::Committed(settings) => {
                if let Err(e) = self.model.apply_negotiated(settings) {
                    error!("[NegotiateRadioLink] Can't apply negotiated settings: {}", e);
                    return;
                }
                if let Err(e) = self.store.save(&self.model) {
                    error!("[NegotiateRadioLink] Can't save vehicle model: {}", e);
                }
                self.notify_model_changed().await;
            }
            NegotiationEvent::Reverted(reason, baseline) => {
                info!(
                    "[NegotiateRadioLink] Reverted to {} ({:?})",
                    baseline.datarate, reason
                );
            }
            NegotiationEvent::Started(_) | NegotiationEvent::Updated(_) | NegotiationEvent::Ignored => {}
        }
    }

    async fn notify_model_changed(&mut self) {
        let packet = self
            .local_control_packet(packet_types::LOCAL_CONTROL_MODEL_CHANGED, &[MODEL_CHANGE_RADIO_DATARATES]);
        self.send_local(packet.clone(), |o| o.telemetry).await;
        self.send_local(packet.clone(), |o| o.commands).await;
        if self.model.rc_enabled {
            self.send_local(packet, |o| o.rc).await;
        }
    }

    async fn deliver_block(&mut self, block: &RecoveredBlock) {
        debug!(
            "[Router] Delivering block {} of stream {} ({} fragments, {} rebuilt)",
            block.block_index,
            block.stream,
            block.fragments.len(),
            block.recovered_fragments
        );
        for (position, fragment) in block.fragments.iter().enumerate() {
            let packet =
                video_block_packet(block.stream, block.block_index, position, self.model.vehicle_id, fragment);
            self.send_local(packet, |o| o.central).await;
        }
    }

    fn local_control_packet(&mut self, packet_type: u8, payload: &[u8]) -> Packet {
        let mut header = PacketHeader::new(Component::LocalControl, packet_type, StreamId::DATA)
            .with_route(self.model.vehicle_id, self.model.vehicle_id);
        header.stream_packet_index = self.local_packet_index;
        self.local_packet_index = self.local_packet_index.wrapping_add(1);
        Packet::new(header, Bytes::copy_from_slice(payload))
    }

    async fn send_local(&mut self, packet: Packet, select: fn(&Outputs) -> ChannelId) {
        self.forward_to_process(&packet, select).await;
    }

    async fn forward_to_process(&mut self, packet: &Packet, select: fn(&Outputs) -> ChannelId) {
        let Some(outputs) = self.outputs else {
            trace!("[Router] IPC channels not open, dropping packet type {}", packet.header.packet_type);
            return;
        };
        let id = select(&outputs);
        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("[Router] Can't encode packet for IPC: {}", e);
                return;
            }
        };
        match self.hub.send(id, &bytes).await {
            Ok(()) => self.stats.ipc_outgoing(),
            Err(e) => warn!("[Router] IPC send on channel {} failed: {}", id, e),
        }
    }

    async fn drain_ipc(&mut self, report: &mut TickReport) {
        let read_timeout = self.config.ipc_read_timeout();
        for slot in 0..self.inputs.len() {
            let mut wait = read_timeout;
            for _ in 0..self.config.ipc.max_messages_per_tick {
                let id = self.inputs[slot];
                match self.hub.try_read(id, wait).await {
                    Ok(Some(message)) => {
                        report.ipc_messages += 1;
                        self.stats.ipc_incoming();
                        self.on_ipc_message(&message, report).await;
                        wait = Duration::ZERO;
                    }
                    Ok(None) => break,
                    Err(IpcError::CorruptStream(_)) => {
                        if self.hub.channel_error_streak(id) >= self.config.ipc.max_read_errors {
                            self.reopen_input(slot);
                        }
                        break;
                    }
                    Err(e) => {
                        warn!("[Router] Reading channel {} failed: {}", id, e);
                        self.reopen_input(slot);
                        break;
                    }
                }
            }
        }
    }

    fn reopen_input(&mut self, slot: usize) {
        let id = self.inputs[slot];
        match self.hub.reopen(id) {
            Ok(new_id) => {
                warn!("[Router] Reopened IPC channel {} as {}", id, new_id);
                self.inputs[slot] = new_id;
            }
            Err(e) => error!("[Router] Can't reopen IPC channel {}: {}", id, e),
        }
    }

    async fn on_ipc_message(&mut self, message: &[u8], report: &mut TickReport) {
        let mut packets = Vec::new();
        for result in PacketChain::new(message) {
            match result {
                Ok(packet) => packets.push(packet),
                Err(e) => {
                    debug!("[Router] Dropping malformed IPC message: {}", e);
                    report.malformed += 1;
                    return;
                }
            }
        }

        let for_relayed = packets.iter().all(|p| self.is_for_relayed_vehicle(p.header.vehicle_id_dest));
        if !packets.is_empty() && for_relayed {
            self.relay_frame(message, false, report).await;
            return;
        }
        for packet in packets {
            match packet.encode() {
                Ok(bytes) => self.outbound.push(bytes),
                Err(e) => warn!("[Router] Can't queue packet: {}", e),
            }
        }
    }

    fn flush_outbound(&mut self) -> usize {
        if self.outbound.is_empty() {
            return 0;
        }
        let port = match self.config.role {
            Role::Vehicle => RadioPort::RouterDownlink,
            Role::Controller => RadioPort::RouterUplink,
        };
        let settings = self.tx_config.active();

        let mut sent = 0;
        for frame in self.outbound.drain_frames() {
            let streams: Vec<(StreamId, usize)> = PacketChain::new(&frame)
                .filter_map(Result::ok)
                .map(|p| (p.header.stream, p.total_length()))
                .collect();
            let links = self.interfaces.transmit_on_links(
                &self.model.radio_links,
                port,
                &frame,
                &streams,
                |_, link, _| (!link.capabilities.is_relay()).then_some(settings),
            );
            if links.is_empty() {
                warn!("[Router] No radio interface could send a {} byte frame", frame.len());
                self.stats.alarm();
            } else {
                sent += 1;
                self.stats.radio_tx();
            }
        }
        sent
    }
}

/// One recovered fragment, wrapped for the central process.
///
/// The header index is the fragment's position in its block; the payload starts with the full
/// block index, which does not fit the header's 28-bit index field.
pub fn video_block_packet(
    stream: StreamId,
    block_index: u32,
    position: usize,
    vehicle_id: VehicleId,
    fragment: &[u8],
) -> Packet {
    let mut header = PacketHeader::new(Component::LocalControl, packet_types::LOCAL_CONTROL_VIDEO_BLOCK, stream)
        .with_route(vehicle_id, vehicle_id);
    header.stream_packet_index = position as u32;
    let mut payload = BytesMut::with_capacity(VIDEO_BLOCK_PREFIX_SIZE + fragment.len());
    payload.put_u32_le(block_index);
    payload.put_slice(fragment);
    Packet::new(header, payload.freeze())
}

/// Splits a `LOCAL_CONTROL_VIDEO_BLOCK` payload into block index and fragment bytes.
pub fn parse_video_block(payload: &[u8]) -> Option<(u32, &[u8])> {
    let (index, fragment) = payload.split_first_chunk::<VIDEO_BLOCK_PREFIX_SIZE>()?;
    Some((u32::from_le_bytes(*index), fragment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fpvlink_core::decode;

    #[test]
    fn test_video_block_keeps_full_block_index() {
        let index = (1u32 << 28) + 5;
        let packet = video_block_packet(StreamId::VIDEO_1, index, 3, 1001, b"frame");
        let decoded = decode(&packet.encode().unwrap()).unwrap();

        assert_eq!(decoded.header.stream_packet_index, 3);
        assert_eq!(parse_video_block(&decoded.payload), Some((index, &b"frame"[..])));

        let last = video_block_packet(StreamId::VIDEO_1, u32::MAX, 0, 1001, b"x");
        assert_eq!(parse_video_block(&last.payload), Some((u32::MAX, &b"x"[..])));
        assert_eq!(parse_video_block(&[1, 2]), None);
    }
}
