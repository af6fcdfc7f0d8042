//! Radio link negotiation
//!
//! The controller probes new datarates by sending `SetDataRate` commands over the
//! very link being changed. Each probe is applied as a temporary override; the
//! session ends with `End` (persist), `Cancel` (restore the baseline) or a timeout
//! (restore the baseline). Every command is echoed back as a confirmation.
//!
//! Payload layout (10 bytes, little-endian):
//!
//! ```text
//! ┌───────────┬─────────┬──────────┬─────────────┐
//! │ direction │ command │ datarate │ frame flags │
//! │ u8        │ u8      │ i32      │ u32         │
//! └───────────┴─────────┴──────────┴─────────────┘
//! ```

use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fpvlink_core::types::packet_types;
use fpvlink_core::{
    CodecError, Component, DataRate, FrameFlags, Packet, PacketHeader, StreamId, TransmitConfig,
    TxSettings, VehicleId,
};

pub const NEGOTIATION_PAYLOAD_SIZE: usize = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("negotiation payload too short ({0} bytes)")]
    TooShort(usize),

    #[error("unknown negotiation direction {0}")]
    UnknownDirection(u8),

    #[error("unknown negotiation command {0}")]
    UnknownCommand(u8),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Request = 0,
    Confirmation = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationCommand {
    SetDataRate(TxSettings),
    End(TxSettings),
    Cancel,
}

impl NegotiationCommand {
    const SET_DATARATE: u8 = 1;
    const END: u8 = 254;
    const CANCEL: u8 = 255;

    fn code(&self) -> u8 {
        match self {
            NegotiationCommand::SetDataRate(_) => Self::SET_DATARATE,
            NegotiationCommand::End(_) => Self::END,
            NegotiationCommand::Cancel => Self::CANCEL,
        }
    }

    fn settings(&self) -> TxSettings {
        match self {
            NegotiationCommand::SetDataRate(s) | NegotiationCommand::End(s) => *s,
            NegotiationCommand::Cancel => TxSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationMessage {
    pub direction: Direction,
    pub command: NegotiationCommand,
}

impl NegotiationMessage {
    pub fn request(command: NegotiationCommand) -> Self {
        Self { direction: Direction::Request, command }
    }

    pub fn encode(&self) -> Bytes {
        let settings = self.command.settings();
        let mut buf = BytesMut::with_capacity(NEGOTIATION_PAYLOAD_SIZE);
        buf.put_u8(self.direction as u8);
        buf.put_u8(self.command.code());
        buf.put_i32_le(settings.datarate.raw());
        buf.put_u32_le(settings.frame_flags.bits());
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, NegotiationError> {
        if payload.len() < NEGOTIATION_PAYLOAD_SIZE {
            return Err(NegotiationError::TooShort(payload.len()));
        }
        let mut buf = payload;
        let direction = match buf.get_u8() {
            0 => Direction::Request,
            1 => Direction::Confirmation,
            other => return Err(NegotiationError::UnknownDirection(other)),
        };
        let code = buf.get_u8();
        let settings = TxSettings::new(
            DataRate::from_raw(buf.get_i32_le()),
            FrameFlags::from_bits_retain(buf.get_u32_le()),
        );
        let command = match code {
            NegotiationCommand::SET_DATARATE => NegotiationCommand::SetDataRate(settings),
            NegotiationCommand::END => NegotiationCommand::End(settings),
            NegotiationCommand::CANCEL => NegotiationCommand::Cancel,
            other => return Err(NegotiationError::UnknownCommand(other)),
        };
        Ok(Self { direction, command })
    }

    /// Wraps the message in a negotiation packet from `src` to `dest`.
    pub fn to_packet(&self, src: VehicleId, dest: VehicleId) -> Packet {
        let header = PacketHeader::new(Component::Ruby, packet_types::NEGOTIATE_RADIO_LINKS, StreamId::DATA)
            .with_route(src, dest);
        Packet::new(header, self.encode())
    }
}

/// Builds the confirmation for a received negotiation packet, addressed to its sender.
pub fn echo_packet(
    received: &PacketHeader,
    message: &NegotiationMessage,
    local_id: VehicleId,
) -> Result<Bytes, NegotiationError> {
    let reply = NegotiationMessage { direction: Direction::Confirmation, command: message.command };
    Ok(reply.to_packet(local_id, received.vehicle_id_src).encode()?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationTimeouts {
    /// Longest a whole session may last.
    pub session_secs: u64,
    /// Longest gap between two commands of one session.
    pub progress_secs: u64,
}

impl NegotiationTimeouts {
    pub fn session(&self) -> Duration {
        Duration::from_secs(self.session_secs)
    }

    pub fn progress(&self) -> Duration {
        Duration::from_secs(self.progress_secs)
    }
}

impl Default for NegotiationTimeouts {
    fn default() -> Self {
        Self { session_secs: 120, progress_secs: 12 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertReason {
    Cancelled,
    SessionTimeout,
    ProgressTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationEvent {
    Started(TxSettings),
    Updated(TxSettings),
    /// Final settings to persist.
    Committed(TxSettings),
    /// The baseline that is active again.
    Reverted(RevertReason, TxSettings),
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Session {
    baseline: TxSettings,
    proposed: TxSettings,
    started: Instant,
    last_progress: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Negotiating(Session),
}

pub struct Negotiator {
    state: State,
    timeouts: NegotiationTimeouts,
}

impl Negotiator {
    pub fn new(timeouts: NegotiationTimeouts) -> Self {
        Self { state: State::Idle, timeouts }
    }

    pub fn is_negotiating(&self) -> bool {
        matches!(self.state, State::Negotiating(_))
    }

    /// Settings captured when the current session started.
    pub fn baseline(&self) -> Option<TxSettings> {
        match self.state {
            State::Negotiating(session) => Some(session.baseline),
            State::Idle => None,
        }
    }

    pub fn proposed(&self) -> Option<TxSettings> {
        match self.state {
            State::Negotiating(session) => Some(session.proposed),
            State::Idle => None,
        }
    }

    pub fn handle(
        &mut self,
        command: NegotiationCommand,
        now: Instant,
        config: &mut TransmitConfig,
    ) -> NegotiationEvent {
        match (self.state, command) {
            (State::Idle, NegotiationCommand::SetDataRate(proposed)) => {
                let baseline = config.active();
                config.set_temporary(proposed);
                self.state = State::Negotiating(Session {
                    baseline,
                    proposed,
                    started: now,
                    last_progress: now,
                });
                info!(
                    "[NegotiateRadioLink] Started negotiation: {} -> {} (flags {:#x})",
                    baseline.datarate,
                    proposed.datarate,
                    proposed.frame_flags.bits()
                );
                NegotiationEvent::Started(proposed)
            }
            (State::Negotiating(mut session), NegotiationCommand::SetDataRate(proposed)) => {
                config.set_temporary(proposed);
                session.proposed = proposed;
                session.last_progress = now;
                self.state = State::Negotiating(session);
                info!(
                    "[NegotiateRadioLink] Testing datarate {} (flags {:#x})",
                    proposed.datarate,
                    proposed.frame_flags.bits()
                );
                NegotiationEvent::Updated(proposed)
            }
            (State::Negotiating(_), NegotiationCommand::End(final_settings)) => {
                config.clear_temporary();
                config.set_base(final_settings);
                self.state = State::Idle;
                info!(
                    "[NegotiateRadioLink] Negotiation ended, committing {} (flags {:#x})",
                    final_settings.datarate,
                    final_settings.frame_flags.bits()
                );
                NegotiationEvent::Committed(final_settings)
            }
            (State::Negotiating(session), NegotiationCommand::Cancel) => {
                info!("[NegotiateRadioLink] Negotiation canceled");
                self.revert(session, RevertReason::Cancelled, config)
            }
            (State::Idle, NegotiationCommand::End(_) | NegotiationCommand::Cancel) => {
                info!("[NegotiateRadioLink] Not negotiating, ignoring {:?}", command);
                NegotiationEvent::Ignored
            }
        }
    }

    /// Reverts a stalled session; `None` when nothing timed out.
    pub fn poll_timeout(&mut self, now: Instant, config: &mut TransmitConfig) -> Option<NegotiationEvent> {
        let State::Negotiating(session) = self.state else {
            return None;
        };
        let reason = if now.saturating_duration_since(session.started) > self.timeouts.session() {
            RevertReason::SessionTimeout
        } else if now.saturating_duration_since(session.last_progress) > self.timeouts.progress() {
            RevertReason::ProgressTimeout
        } else {
            return None;
        };
        warn!("[NegotiateRadioLink] Negotiation timed out ({:?}), reverting", reason);
        Some(self.revert(session, reason, config))
    }

    fn revert(&mut self, session: Session, reason: RevertReason, config: &mut TransmitConfig) -> NegotiationEvent {
        config.clear_temporary();
        config.set_base(session.baseline);
        self.state = State::Idle;
        NegotiationEvent::Reverted(reason, session.baseline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn baseline() -> TxSettings {
        TxSettings::new(DataRate::Fixed(12_000_000), FrameFlags::USE_LEGACY_DATARATES | FrameFlags::HT20)
    }

    fn probe(mcs: u8) -> TxSettings {
        TxSettings::new(DataRate::Mcs(mcs), FrameFlags::USE_MCS_DATARATES | FrameFlags::LDPC)
    }

    fn negotiator() -> (Negotiator, TransmitConfig, Instant) {
        (Negotiator::new(NegotiationTimeouts::default()), TransmitConfig::new(baseline()), Instant::now())
    }

    #[test]
    fn test_message_layout() {
        let message = NegotiationMessage::request(NegotiationCommand::SetDataRate(TxSettings::new(
            DataRate::Mcs(2),
            FrameFlags::from_bits_retain(0x0102_0304),
        )));
        let bytes = message.encode();
        assert_eq!(&bytes[..], &[0, 1, 0xFD, 0xFF, 0xFF, 0xFF, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(NegotiationMessage::decode(&bytes).unwrap(), message);

        assert_eq!(NegotiationMessage::decode(&bytes[..9]), Err(NegotiationError::TooShort(9)));
        assert_eq!(
            NegotiationMessage::decode(&[0, 7, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(NegotiationError::UnknownCommand(7))
        );
        assert_eq!(
            NegotiationMessage::decode(&[3, 1, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(NegotiationError::UnknownDirection(3))
        );
    }

    #[test]
    fn test_echo_is_addressed_to_sender() {
        let message = NegotiationMessage::request(NegotiationCommand::Cancel);
        let request = message.to_packet(9000, 42);
        let echo = echo_packet(&request.header, &message, 42).unwrap();

        let decoded = fpvlink_core::decode(&echo).unwrap();
        assert_eq!(decoded.header.vehicle_id_src, 42);
        assert_eq!(decoded.header.vehicle_id_dest, 9000);
        assert_eq!(decoded.header.packet_type, packet_types::NEGOTIATE_RADIO_LINKS);
        let reply = NegotiationMessage::decode(&decoded.payload).unwrap();
        assert_eq!(reply.direction, Direction::Confirmation);
        assert_eq!(reply.command, NegotiationCommand::Cancel);
    }

    #[test]
    fn test_commit() {
        let (mut negotiator, mut config, now) = negotiator();
        assert_eq!(
            negotiator.handle(NegotiationCommand::SetDataRate(probe(3)), now, &mut config),
            NegotiationEvent::Started(probe(3))
        );
        assert_eq!(config.active(), probe(3));
        assert_eq!(config.base(), baseline());

        assert_eq!(
            negotiator.handle(NegotiationCommand::End(probe(3)), now, &mut config),
            NegotiationEvent::Committed(probe(3))
        );
        assert!(!negotiator.is_negotiating());
        assert_eq!(config.active(), probe(3));
        assert_eq!(config.temporary(), None);
    }

    #[test]
    fn test_baseline_captured_once() {
        let (mut negotiator, mut config, now) = negotiator();
        negotiator.handle(NegotiationCommand::SetDataRate(probe(1)), now, &mut config);
        negotiator.handle(NegotiationCommand::SetDataRate(probe(5)), now, &mut config);
        assert_eq!(negotiator.baseline(), Some(baseline()));
        assert_eq!(negotiator.proposed(), Some(probe(5)));

        assert_eq!(
            negotiator.handle(NegotiationCommand::Cancel, now, &mut config),
            NegotiationEvent::Reverted(RevertReason::Cancelled, baseline())
        );
        assert_eq!(config.active(), baseline());
    }

    #[test]
    fn test_end_and_cancel_ignored_when_idle() {
        let (mut negotiator, mut config, now) = negotiator();
        assert_eq!(negotiator.handle(NegotiationCommand::End(probe(2)), now, &mut config), NegotiationEvent::Ignored);
        assert_eq!(negotiator.handle(NegotiationCommand::Cancel, now, &mut config), NegotiationEvent::Ignored);
        assert_eq!(config.active(), baseline());
    }

    #[test]
    fn test_progress_timeout_reverts() {
        let (mut negotiator, mut config, start) = negotiator();
        negotiator.handle(NegotiationCommand::SetDataRate(probe(4)), start, &mut config);

        assert_eq!(negotiator.poll_timeout(start + Duration::from_secs(12), &mut config), None);
        assert_eq!(
            negotiator.poll_timeout(start + Duration::from_secs(13), &mut config),
            Some(NegotiationEvent::Reverted(RevertReason::ProgressTimeout, baseline()))
        );
        assert_eq!(config.active(), baseline());
        assert_eq!(negotiator.poll_timeout(start + Duration::from_secs(60), &mut config), None);
    }

    #[test]
    fn test_session_timeout_despite_progress() {
        let (mut negotiator, mut config, start) = negotiator();
        for step in 0..=12u64 {
            let now = start + Duration::from_secs(step * 10);
            negotiator.handle(NegotiationCommand::SetDataRate(probe(step as u8)), now, &mut config);
            assert_eq!(negotiator.poll_timeout(now, &mut config), None);
        }
        assert_eq!(
            negotiator.poll_timeout(start + Duration::from_secs(121), &mut config),
            Some(NegotiationEvent::Reverted(RevertReason::SessionTimeout, baseline()))
        );
    }

    proptest! {
        #[test]
        fn prop_cancel_or_timeout_restores_baseline(
            probes in proptest::collection::vec(0u8..10, 1..20),
            timeout in any::<bool>(),
        ) {
            let (mut negotiator, mut config, start) = negotiator();
            for (i, mcs) in probes.iter().enumerate() {
                let now = start + Duration::from_secs(i as u64);
                negotiator.handle(NegotiationCommand::SetDataRate(probe(*mcs)), now, &mut config);
            }
            let end = start + Duration::from_secs(probes.len() as u64);
            if timeout {
                let later = end + Duration::from_secs(200);
                prop_assert!(negotiator.poll_timeout(later, &mut config).is_some());
            } else {
                negotiator.handle(NegotiationCommand::Cancel, end, &mut config);
            }
            prop_assert_eq!(config.active(), baseline());
            prop_assert!(!negotiator.is_negotiating());
        }
    }
}
