//! Bounded outbound packet queue feeding the radio writer

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use log::{debug, warn};

use fpvlink_core::types::MAX_PACKET_TOTAL_SIZE;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: u64,
    pub dropped: u64,
    pub dequeued: u64,
}

/// FIFO of encoded packets; when full the oldest packet is dropped.
pub struct PacketQueue {
    packets: VecDeque<Bytes>,
    capacity: usize,
    stats: QueueStats,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            packets: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            stats: QueueStats::default(),
        }
    }

    pub fn push(&mut self, packet: Bytes) {
        if self.packets.len() >= self.capacity {
            self.packets.pop_front();
            self.stats.dropped += 1;
            warn!("Outbound queue full ({} packets), dropped oldest", self.capacity);
        }
        self.packets.push_back(packet);
        self.stats.queued += 1;
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    /// Pops queued packets and chains them into radio frames of at most
    /// `MAX_PACKET_TOTAL_SIZE` bytes each.
    pub fn drain_frames(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        let mut current = BytesMut::new();
        while let Some(packet) = self.packets.pop_front() {
            self.stats.dequeued += 1;
            if !current.is_empty() && current.len() + packet.len() > MAX_PACKET_TOTAL_SIZE {
                frames.push(current.split().freeze());
            }
            current.extend_from_slice(&packet);
        }
        if !current.is_empty() {
            frames.push(current.freeze());
        }
        if !frames.is_empty() {
            debug!("Drained outbound queue into {} radio frames", frames.len());
        }
        frames
    }
}
