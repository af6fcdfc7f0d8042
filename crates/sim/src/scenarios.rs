//! Simulation scenarios for erasure-coded video over a lossy link

use std::collections::HashMap;

use anyhow::Result;
use indicatif::ProgressBar;
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fpvlink_core::types::packet_types;
use fpvlink_core::{decode, Component, FecProfile, Packet, PacketHeader, StreamId, TxSettings};
use fpvlink_radio::{
    FecConfig, FecEncoder, FecReconstructor, LinkConditions, OutboundFrame, RadioInterface, RadioPort,
    SimulatedRadio,
};

const STREAM: StreamId = StreamId::VIDEO_1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FecReport {
    pub blocks: u32,
    /// Blocks handed on intact.
    pub delivered: u32,
    /// Delivered blocks that needed parity.
    pub recovered_with_parity: u32,
    pub lost: u32,
    /// Delivered blocks whose bytes differ from what was sent.
    pub mismatched: u32,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub frames_rejected: u64,
}

impl FecReport {
    pub fn delivery_ratio(&self) -> f64 {
        if self.blocks == 0 {
            return 0.0;
        }
        self.delivered as f64 / self.blocks as f64
    }
}

/// Sends `blocks` video blocks through a simulated link and counts what comes out.
///
/// Each fragment travels as its own video packet; the receiver decodes,
/// feeds the reconstructor and checks every emitted block against the data that was sent.
pub fn fec_recovery(
    profile: FecProfile,
    conditions: LinkConditions,
    blocks: u32,
    fragment_size: usize,
    progress: &ProgressBar,
) -> Result<FecReport> {
    let mut content_rng = match conditions.seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ 0x5eed),
        None => StdRng::from_rng(&mut rand::rng()),
    };
    let (mut tx, mut rx) = SimulatedRadio::pair("fec", conditions);
    let encoder = FecEncoder::new(profile, fragment_size)?;
    let mut reconstructor = FecReconstructor::new(FecConfig::default());
    reconstructor.set_profile(STREAM, profile)?;

    let mut report = FecReport { blocks, ..FecReport::default() };
    let mut sent: HashMap<u32, Vec<Vec<u8>>> = HashMap::new();
    progress.set_length(blocks as u64);

    for block_index in 0..blocks {
        let data: Vec<Vec<u8>> = (0..profile.data_fragments())
            .map(|_| {
                let len = content_rng.random_range(1..=encoder.max_data_len());
                (0..len).map(|_| content_rng.random()).collect()
            })
            .collect();
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();

        for fragment in encoder.encode_block(block_index, &refs, false)? {
            let mut header = PacketHeader::new(Component::Video, packet_types::VIDEO_DATA, STREAM);
            header.stream_packet_index = block_index;
            let frame = OutboundFrame {
                port: RadioPort::RouterDownlink,
                settings: TxSettings::default(),
                payload: Packet::new(header, fragment).encode()?,
            };
            tx.write_frame(&frame)?;
        }
        sent.insert(block_index, data);

        while let Some(frame) = rx.try_receive()? {
            let packet = match decode(&frame) {
                Ok(packet) => packet,
                Err(e) => {
                    trace!("Receiver dropped frame: {}", e);
                    report.frames_rejected += 1;
                    continue;
                }
            };
            if let Err(e) = reconstructor.ingest_payload(packet.header.stream, &packet.payload) {
                debug!("Reconstructor rejected fragment: {}", e);
                report.frames_rejected += 1;
            }
        }

        for block in reconstructor.try_emit(STREAM) {
            let Some(expected) = sent.remove(&block.block_index) else {
                continue;
            };
            let intact = block.fragments.len() == expected.len()
                && block.fragments.iter().zip(&expected).all(|(got, want)| got[..] == want[..]);
            if intact {
                report.delivered += 1;
                if block.recovered_fragments > 0 {
                    report.recovered_with_parity += 1;
                }
            } else {
                report.mismatched += 1;
            }
        }
        // anything older than the window can no longer be emitted
        sent.retain(|&index, _| index + FecConfig::default().reset_gap > block_index);
        progress.inc(1);
    }

    let stats = tx.stats();
    report.frames_sent = stats.frames_sent;
    report.frames_dropped = stats.frames_dropped;
    report.lost = blocks - report.delivered - report.mismatched;
    progress.finish_and_clear();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(packet_loss: f32) -> LinkConditions {
        LinkConditions { packet_loss, seed: Some(42), ..LinkConditions::default() }
    }

    #[test]
    fn test_perfect_link_delivers_everything() {
        let profile = FecProfile::new(8, 12).unwrap();
        let report = fec_recovery(profile, LinkConditions::perfect(), 50, 256, &ProgressBar::hidden()).unwrap();
        assert_eq!(report.delivered, 50);
        assert_eq!(report.recovered_with_parity, 0);
        assert_eq!(report.lost, 0);
        assert_eq!(report.frames_sent, 50 * 12);
        assert_eq!(report.frames_dropped, 0);
    }

    #[test]
    fn test_dead_link_delivers_nothing() {
        let profile = FecProfile::new(4, 6).unwrap();
        let report = fec_recovery(profile, seeded(1.0), 20, 128, &ProgressBar::hidden()).unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(report.lost, 20);
        assert_eq!(report.frames_dropped, report.frames_sent);
    }

    #[test]
    fn test_parity_beats_plain_blocks_on_lossy_link() {
        let blocks = 200;
        let with_parity =
            fec_recovery(FecProfile::new(8, 12).unwrap(), seeded(0.15), blocks, 256, &ProgressBar::hidden())
                .unwrap();
        let without_parity =
            fec_recovery(FecProfile::new(8, 8).unwrap(), seeded(0.15), blocks, 256, &ProgressBar::hidden())
                .unwrap();

        assert_eq!(with_parity.mismatched, 0);
        assert!(with_parity.recovered_with_parity > 0);
        assert!(with_parity.delivery_ratio() > 0.75, "{:?}", with_parity);
        assert!(without_parity.delivery_ratio() < with_parity.delivery_ratio());
    }
}
