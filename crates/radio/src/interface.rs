//! Radio interfaces and the links they are bound to

use bytes::Bytes;
use log::{trace, warn};

use fpvlink_core::model::{RadioInterfaceParams, RadioLinkParams};
use fpvlink_core::types::MAX_RADIO_STREAMS;
use fpvlink_core::{LinkCapabilities, StreamId, TxSettings};

use crate::RadioError;

/// Router port byte prepended to every radio frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RadioPort {
    RouterUplink = 0x0E,
    RouterDownlink = 0x0F,
}

impl RadioPort {
    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x0E => Some(RadioPort::RouterUplink),
            0x0F => Some(RadioPort::RouterDownlink),
            _ => None,
        }
    }
}

/// One radio frame: a chain of encoded packets plus how to modulate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub port: RadioPort,
    pub settings: TxSettings,
    pub payload: Bytes,
}

/// A physical (or simulated) radio card.
///
/// Writes never block: a frame is either handed to the hardware or rejected.
pub trait RadioInterface {
    fn name(&self) -> &str;
    fn is_open_for_write(&self) -> bool;
    fn write_frame(&mut self, frame: &OutboundFrame) -> Result<(), RadioError>;
    /// Next received frame payload, or `None` when nothing is pending.
    fn try_receive(&mut self) -> Result<Option<Vec<u8>>, RadioError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    pub packets: u64,
    pub bytes: u64,
}

impl TrafficCounters {
    fn add(&mut self, packets: u64, bytes: u64) {
        self.packets += packets;
        self.bytes += bytes;
    }
}

/// Per-link and per-stream transmit counters.
#[derive(Debug, Clone, Default)]
pub struct TxAccounting {
    links: Vec<TrafficCounters>,
    streams: [TrafficCounters; MAX_RADIO_STREAMS as usize],
}

impl TxAccounting {
    pub fn record_link(&mut self, link_id: u8, bytes: usize) {
        let index = link_id as usize;
        if self.links.len() <= index {
            self.links.resize(index + 1, TrafficCounters::default());
        }
        self.links[index].add(1, bytes as u64);
    }

    pub fn record_stream(&mut self, stream: StreamId, bytes: usize) {
        self.streams[stream.index()].add(1, bytes as u64);
    }

    pub fn link(&self, link_id: u8) -> TrafficCounters {
        self.links.get(link_id as usize).copied().unwrap_or_default()
    }

    pub fn stream(&self, stream: StreamId) -> TrafficCounters {
        self.streams[stream.index()]
    }
}

struct BoundInterface {
    params: RadioInterfaceParams,
    radio: Box<dyn RadioInterface>,
}

/// Every radio interface of the node, each bound to one radio link.
#[derive(Default)]
pub struct RadioInterfaces {
    interfaces: Vec<BoundInterface>,
    accounting: TxAccounting,
}

impl RadioInterfaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, params: RadioInterfaceParams, radio: Box<dyn RadioInterface>) {
        self.interfaces.push(BoundInterface { params, radio });
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    pub fn accounting(&self) -> &TxAccounting {
        &self.accounting
    }

    /// Refreshes interface parameters after a model change, matching by position.
    pub fn update_params(&mut self, params: &[RadioInterfaceParams]) {
        for (bound, params) in self.interfaces.iter_mut().zip(params) {
            bound.params = params.clone();
        }
    }

    /// Sends `payload` through every usable interface of every link `select` accepts.
    ///
    /// `select` returns the modulation for a link/interface pair, or `None` to skip it.
    /// `streams` lists the stream and length of each packet in the chain, for accounting.
    /// Returns the ids of links at least one interface transmitted on.
    pub fn transmit_on_links<F>(
        &mut self,
        links: &[RadioLinkParams],
        port: RadioPort,
        payload: &Bytes,
        streams: &[(StreamId, usize)],
        mut select: F,
    ) -> Vec<u8>
    where
        F: FnMut(u8, &RadioLinkParams, &RadioInterfaceParams) -> Option<TxSettings>,
    {
        let mut sent_links = Vec::new();
        for bound in &mut self.interfaces {
            let link_id = bound.params.link_id;
            let Some(link) = links.get(link_id as usize) else {
                continue;
            };
            if !link.capabilities.can_transmit() || !bound.params.capabilities.can_transmit() {
                continue;
            }
            if !bound.radio.is_open_for_write() {
                continue;
            }
            let Some(settings) = select(link_id, link, &bound.params) else {
                continue;
            };

            let frame = OutboundFrame { port, settings, payload: payload.clone() };
            match bound.radio.write_frame(&frame) {
                Ok(()) => {
                    trace!(
                        "Sent {} bytes on link {} via {} at {}",
                        payload.len(),
                        link_id,
                        bound.radio.name(),
                        settings.datarate
                    );
                    self.accounting.record_link(link_id, payload.len());
                    for &(stream, len) in streams {
                        self.accounting.record_stream(stream, len);
                    }
                    if !sent_links.contains(&link_id) {
                        sent_links.push(link_id);
                    }
                }
                Err(e) => warn!("Failed to write radio frame on {}: {}", bound.radio.name(), e),
            }
        }
        sent_links
    }

    /// Drains every pending frame from each interface, tagged with the interface's link id.
    pub fn receive_all(&mut self) -> Vec<(u8, Vec<u8>)> {
        let mut frames = Vec::new();
        for bound in &mut self.interfaces {
            if bound.params.capabilities.contains(LinkCapabilities::DISABLED) {
                continue;
            }
            loop {
                match bound.radio.try_receive() {
                    Ok(Some(frame)) => frames.push((bound.params.link_id, frame)),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Radio receive failed on {}: {}", bound.radio.name(), e);
                        break;
                    }
                }
            }
        }
        frames
    }
}
