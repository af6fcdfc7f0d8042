//! Erasure-coded block encoding and reconstruction
//!
//! A block is `K` data fragments followed by `N - K` parity fragments computed
//! with a systematic Reed-Solomon code. Every fragment travels in its own radio
//! packet, prefixed by an 8-byte fragment header:
//!
//! ```text
//! ┌──────────────┬────────────┬─────┬─────┬──────────┐
//! │ block index  │ fragment   │  K  │  N  │ reserved │
//! │ u32 LE       │ u8         │ u8  │ u8  │ u8       │
//! └──────────────┴────────────┴─────┴─────┴──────────┘
//! ```
//!
//! `K = N = 0` means the profile is configured out of band for the stream.
//! Inside the coded area each data fragment starts with its own u16 length so
//! fragments of different sizes come back byte-exact after reconstruction.
//!
//! On the receive side each stream keeps a small window of consecutive blocks.
//! Only the oldest block is ever emitted, so recovered blocks leave in strictly
//! increasing index order. Newer indices push old blocks out of the window; a
//! jump larger than `reset_gap` drops the whole window. An index more than
//! `reset_gap` behind the window means the sender restarted its block counter,
//! so the window starts over there. Indices compare with serial-number
//! arithmetic and wrap past `u32::MAX`.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, trace, warn};
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fpvlink_core::types::{MAX_PACKET_PAYLOAD, MAX_RADIO_STREAMS};
use fpvlink_core::{FecProfile, StreamId};

pub const FRAGMENT_HEADER_SIZE: usize = 8;
const LENGTH_PREFIX_SIZE: usize = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FecError {
    #[error("fragment shorter than its header")]
    TruncatedFragment,

    #[error("invalid FEC profile {data}/{total}")]
    InvalidProfile { data: u8, total: u8 },

    #[error("fragment index {index} out of range for {total} fragments")]
    FragmentOutOfRange { index: u8, total: usize },

    #[error("fragment {index} parity marker disagrees with the block profile")]
    ParityMismatch { index: u8 },

    #[error("no FEC profile configured for stream {0}")]
    NoProfile(StreamId),

    #[error("fragment profile does not match the profile of stream {0}")]
    ProfileMismatch(StreamId),

    #[error("empty fragment")]
    EmptyFragment,

    #[error("fragment of {0} bytes exceeds the maximum fragment size")]
    FragmentTooLarge(usize),

    #[error("fragment size {actual} differs from block fragment size {expected}")]
    FragmentSizeMismatch { expected: usize, actual: usize },

    #[error("expected {expected} data fragments, got {actual}")]
    WrongFragmentCount { expected: usize, actual: usize },

    #[error("stream index {0} out of range")]
    InvalidStream(u8),

    #[error("erasure coding failed: {0}")]
    Erasure(String),

    #[error("reconstructed fragment has an invalid length prefix")]
    CorruptFragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub block_index: u32,
    pub fragment_index: u8,
    /// `None` when the stream profile is established out of band.
    pub profile: Option<FecProfile>,
}

impl FragmentHeader {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.block_index);
        buf.put_u8(self.fragment_index);
        match self.profile {
            Some(profile) => {
                buf.put_u8(profile.data_fragments() as u8);
                buf.put_u8(profile.total_fragments() as u8);
            }
            None => buf.put_bytes(0, 2),
        }
        buf.put_u8(0);
    }

    /// Splits a video/data packet payload into fragment header and fragment bytes.
    pub fn parse(payload: &[u8]) -> Result<(FragmentHeader, &[u8]), FecError> {
        if payload.len() < FRAGMENT_HEADER_SIZE {
            return Err(FecError::TruncatedFragment);
        }
        let block_index = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let fragment_index = payload[4];
        let (data, total) = (payload[5], payload[6]);
        let profile = match (data, total) {
            (0, 0) => None,
            _ => Some(
                FecProfile::new(data, total)
                    .map_err(|_| FecError::InvalidProfile { data, total })?,
            ),
        };
        let header = FragmentHeader { block_index, fragment_index, profile };
        Ok((header, &payload[FRAGMENT_HEADER_SIZE..]))
    }
}

fn build_coder(profile: FecProfile) -> Result<Option<ReedSolomon>, FecError> {
    if !profile.has_parity() {
        return Ok(None);
    }
    ReedSolomon::new(profile.data_fragments(), profile.parity_fragments())
        .map(Some)
        .map_err(|e| FecError::Erasure(format!("{:?}", e)))
}

/// Sender side: turns `K` data fragments into `N` fragment payloads.
pub struct FecEncoder {
    profile: FecProfile,
    coder: Option<ReedSolomon>,
    max_fragment_size: usize,
}

impl FecEncoder {
    pub fn new(profile: FecProfile, max_fragment_size: usize) -> Result<Self, FecError> {
        Ok(Self { profile, coder: build_coder(profile)?, max_fragment_size })
    }

    pub fn profile(&self) -> FecProfile {
        self.profile
    }

    /// Largest data fragment `encode_block` accepts.
    pub fn max_data_len(&self) -> usize {
        self.max_fragment_size - LENGTH_PREFIX_SIZE
    }

    /// Encodes one block. With `inline_profile` every fragment header carries K/N.
    pub fn encode_block(
        &self,
        block_index: u32,
        data: &[&[u8]],
        inline_profile: bool,
    ) -> Result<Vec<Bytes>, FecError> {
        let k = self.profile.data_fragments();
        if data.len() != k {
            return Err(FecError::WrongFragmentCount { expected: k, actual: data.len() });
        }
        let longest = data.iter().map(|d| d.len()).max().unwrap_or(0);
        let shard_size = longest + LENGTH_PREFIX_SIZE;
        if shard_size > self.max_fragment_size {
            return Err(FecError::FragmentTooLarge(shard_size));
        }

        let mut shards: Vec<Vec<u8>> = data
            .iter()
            .map(|fragment| {
                let mut shard = vec![0u8; shard_size];
                shard[..LENGTH_PREFIX_SIZE].copy_from_slice(&(fragment.len() as u16).to_le_bytes());
                shard[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + fragment.len()].copy_from_slice(fragment);
                shard
            })
            .collect();
        shards.resize(self.profile.total_fragments(), vec![0u8; shard_size]);

        if let Some(coder) = &self.coder {
            coder
                .encode(&mut shards)
                .map_err(|e| FecError::Erasure(format!("{:?}", e)))?;
        }

        let profile = inline_profile.then_some(self.profile);
        let fragments = shards
            .iter()
            .enumerate()
            .map(|(i, shard)| {
                let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE + shard.len());
                FragmentHeader { block_index, fragment_index: i as u8, profile }.write(&mut buf);
                buf.put_slice(shard);
                buf.freeze()
            })
            .collect();
        trace!(
            "[FEC] Encoded block {} into {} fragments of {} bytes",
            block_index,
            self.profile.total_fragments(),
            shard_size
        );
        Ok(fragments)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FecConfig {
    /// Blocks held per stream.
    pub window_depth: u32,
    /// An index more than this many blocks away from the oldest block resets the window.
    pub reset_gap: u32,
    pub max_fragment_size: usize,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            window_depth: 10,
            reset_gap: 20,
            max_fragment_size: MAX_PACKET_PAYLOAD,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FecStats {
    pub stored: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub resets: u64,
    pub emitted: u64,
    pub recovered_with_parity: u64,
    pub failed: u64,
}

/// What happened to an ingested fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Stored,
    Duplicate,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredBlock {
    pub stream: StreamId,
    pub block_index: u32,
    /// The `K` data fragments in order, length prefixes stripped.
    pub fragments: Vec<Bytes>,
    /// How many data fragments had to be rebuilt from parity.
    pub recovered_fragments: usize,
}

impl RecoveredBlock {
    pub fn payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.fragments.iter().map(Bytes::len).sum());
        for fragment in &self.fragments {
            buf.put_slice(fragment);
        }
        buf.freeze()
    }
}

struct Block {
    shards: Vec<Option<Vec<u8>>>,
    shard_size: Option<usize>,
    data_received: usize,
    parity_received: usize,
}

impl Block {
    fn empty() -> Self {
        Self { shards: Vec::new(), shard_size: None, data_received: 0, parity_received: 0 }
    }

    fn received(&self) -> usize {
        self.data_received + self.parity_received
    }

    fn has_fragment(&self, index: usize) -> bool {
        self.shards.get(index).is_some_and(Option::is_some)
    }
}

struct Fragment<'a> {
    block_index: u32,
    fragment_index: u8,
    is_parity: Option<bool>,
    inline_profile: Option<FecProfile>,
    bytes: &'a [u8],
}

/// Where a block index falls relative to the oldest block of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Ahead(u32),
    Behind(u32),
}

fn position(base: u32, block_index: u32) -> Position {
    let ahead = block_index.wrapping_sub(base);
    if ahead < 1 << 31 {
        Position::Ahead(ahead)
    } else {
        Position::Behind(base.wrapping_sub(block_index))
    }
}

/// Reconstruction state of a single stream.
pub struct StreamWindow {
    stream: StreamId,
    config: FecConfig,
    profile: Option<FecProfile>,
    coder: Option<ReedSolomon>,
    blocks: VecDeque<Block>,
    /// Index of `blocks[0]`; anything below it is stale.
    base: Option<u32>,
    last_emitted: Option<u32>,
    stats: FecStats,
}

impl StreamWindow {
    pub fn new(stream: StreamId, config: FecConfig) -> Self {
        let window_depth = config.window_depth.max(1);
        let config = FecConfig {
            window_depth,
            reset_gap: config.reset_gap.max(window_depth),
            ..config
        };
        Self {
            stream,
            config,
            profile: None,
            coder: None,
            blocks: VecDeque::with_capacity(window_depth as usize),
            base: None,
            last_emitted: None,
            stats: FecStats::default(),
        }
    }

    pub fn profile(&self) -> Option<FecProfile> {
        self.profile
    }

    /// Explicit profile change: pending blocks were coded with the old profile and are dropped.
    pub fn set_profile(&mut self, profile: FecProfile) -> Result<(), FecError> {
        if self.profile == Some(profile) {
            return Ok(());
        }
        self.coder = build_coder(profile)?;
        self.profile = Some(profile);
        if !self.blocks.is_empty() {
            debug!(
                "[FEC] Stream {}: profile changed to {}/{}, dropping {} pending blocks",
                self.stream,
                profile.data_fragments(),
                profile.total_fragments(),
                self.blocks.len()
            );
            self.stats.evicted += self.blocks.len() as u64;
            self.blocks.clear();
        }
        self.base = self.last_emitted.map(|i| i.wrapping_add(1));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn last_emitted(&self) -> Option<u32> {
        self.last_emitted
    }

    pub fn stats(&self) -> FecStats {
        self.stats
    }

    fn ingest(&mut self, fragment: Fragment<'_>) -> Result<Ingest, FecError> {
        let result = self.store(fragment);
        if result.is_err() {
            self.stats.rejected += 1;
        }
        result
    }

    fn resolve_profile(&mut self, inline: Option<FecProfile>) -> Result<FecProfile, FecError> {
        match (inline, self.profile) {
            (Some(inline), Some(current)) if inline != current => {
                Err(FecError::ProfileMismatch(self.stream))
            }
            (_, Some(current)) => Ok(current),
            (Some(inline), None) => {
                self.set_profile(inline)?;
                Ok(inline)
            }
            (None, None) => Err(FecError::NoProfile(self.stream)),
        }
    }

    fn store(&mut self, fragment: Fragment<'_>) -> Result<Ingest, FecError> {
        let profile = self.resolve_profile(fragment.inline_profile)?;
        let index = fragment.fragment_index as usize;
        let total = profile.total_fragments();
        if index >= total {
            return Err(FecError::FragmentOutOfRange { index: fragment.fragment_index, total });
        }
        let is_parity = index >= profile.data_fragments();
        if fragment.is_parity.is_some_and(|declared| declared != is_parity) {
            return Err(FecError::ParityMismatch { index: fragment.fragment_index });
        }
        let size = fragment.bytes.len();
        if size == 0 {
            return Err(FecError::EmptyFragment);
        }
        if size > self.config.max_fragment_size {
            return Err(FecError::FragmentTooLarge(size));
        }

        let block_index = fragment.block_index;
        if let Some(base) = self.base {
            match position(base, block_index) {
                Position::Behind(behind) if behind > self.config.reset_gap => {
                    self.restart(block_index, behind);
                }
                Position::Behind(_) => {
                    self.stats.stale += 1;
                    trace!("[FEC] Stream {}: stale fragment for block {}", self.stream, block_index);
                    return Ok(Ingest::Stale);
                }
                Position::Ahead(offset) => {
                    if let Some(block) = self.blocks.get(offset as usize) {
                        if let Some(expected) = block.shard_size {
                            if expected != size {
                                return Err(FecError::FragmentSizeMismatch { expected, actual: size });
                            }
                        }
                        if block.has_fragment(index) {
                            self.stats.duplicates += 1;
                            return Ok(Ingest::Duplicate);
                        }
                    }
                }
            }
        }

        let slot = self.place(block_index);
        let block = &mut self.blocks[slot];
        if block.shards.is_empty() {
            block.shards.resize(total, None);
            block.shard_size = Some(size);
        }
        block.shards[index] = Some(fragment.bytes.to_vec());
        if is_parity {
            block.parity_received += 1;
        } else {
            block.data_received += 1;
        }
        self.stats.stored += 1;
        Ok(Ingest::Stored)
    }

    /// The sender's block counter went backwards: start over at `block_index`.
    fn restart(&mut self, block_index: u32, behind: u32) {
        warn!(
            "[FEC] Stream {}: block {} is {} blocks behind the window, sender restarted ({} pending blocks dropped)",
            self.stream,
            block_index,
            behind,
            self.blocks.len()
        );
        self.stats.resets += 1;
        self.stats.evicted += self.blocks.len() as u64;
        self.blocks.clear();
        self.last_emitted = None;
        self.base = Some(block_index);
    }

    /// Makes room for `block_index` and returns its slot in the window.
    /// `block_index` is never behind the window here.
    fn place(&mut self, block_index: u32) -> usize {
        let depth = self.config.window_depth;
        let base = *self.base.get_or_insert(block_index);
        let mut offset = block_index.wrapping_sub(base);

        if offset > self.config.reset_gap {
            warn!(
                "[FEC] Stream {}: block {} is {} blocks ahead of the window, resetting ({} pending blocks dropped)",
                self.stream,
                block_index,
                offset,
                self.blocks.len()
            );
            self.stats.resets += 1;
            self.stats.evicted += self.blocks.len() as u64;
            self.blocks.clear();
            self.base = Some(block_index);
            offset = 0;
        } else if offset >= depth {
            let shift = offset - depth + 1;
            let evicted = (shift as usize).min(self.blocks.len());
            for block in self.blocks.drain(..evicted) {
                debug!(
                    "[FEC] Stream {}: evicting incomplete block ({} of {} fragments)",
                    self.stream,
                    block.received(),
                    block.shards.len()
                );
            }
            self.stats.evicted += evicted as u64;
            self.base = Some(base.wrapping_add(shift));
            offset -= shift;
        }

        let slot = offset as usize;
        while self.blocks.len() <= slot {
            self.blocks.push_back(Block::empty());
        }
        slot
    }

    /// Emits every leading block that has at least `K` fragments.
    pub fn try_emit(&mut self) -> Vec<RecoveredBlock> {
        let mut emitted = Vec::new();
        let Some(profile) = self.profile else {
            return emitted;
        };
        let k = profile.data_fragments();

        while self.blocks.front().is_some_and(|b| b.received() >= k) {
            let (Some(block), Some(base)) = (self.blocks.pop_front(), self.base) else {
                break;
            };
            self.base = Some(base.wrapping_add(1));
            match self.reconstruct(block, profile) {
                Ok((fragments, recovered_fragments)) => {
                    self.last_emitted = Some(base);
                    self.stats.emitted += 1;
                    if recovered_fragments > 0 {
                        self.stats.recovered_with_parity += 1;
                        debug!(
                            "[FEC] Stream {}: recovered {} fragments of block {} from parity",
                            self.stream, recovered_fragments, base
                        );
                    }
                    emitted.push(RecoveredBlock {
                        stream: self.stream,
                        block_index: base,
                        fragments,
                        recovered_fragments,
                    });
                }
                Err(e) => {
                    self.stats.failed += 1;
                    warn!("[FEC] Stream {}: dropping block {}: {}", self.stream, base, e);
                }
            }
        }
        emitted
    }

    fn reconstruct(&self, block: Block, profile: FecProfile) -> Result<(Vec<Bytes>, usize), FecError> {
        let k = profile.data_fragments();
        let mut shards = block.shards;
        let missing = k - block.data_received;

        if missing > 0 {
            let coder = self
                .coder
                .as_ref()
                .ok_or_else(|| FecError::Erasure("no parity configured".into()))?;
            coder
                .reconstruct_data(&mut shards)
                .map_err(|e| FecError::Erasure(format!("{:?}", e)))?;
        }

        let fragments = shards
            .into_iter()
            .take(k)
            .map(|shard| {
                let shard = shard.ok_or(FecError::CorruptFragment)?;
                if shard.len() < LENGTH_PREFIX_SIZE {
                    return Err(FecError::CorruptFragment);
                }
                let len = u16::from_le_bytes([shard[0], shard[1]]) as usize;
                let end = LENGTH_PREFIX_SIZE + len;
                if end > shard.len() {
                    return Err(FecError::CorruptFragment);
                }
                Ok(Bytes::copy_from_slice(&shard[LENGTH_PREFIX_SIZE..end]))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((fragments, missing))
    }
}

/// Per-stream reconstruction for every radio stream.
pub struct FecReconstructor {
    streams: Vec<StreamWindow>,
}

impl FecReconstructor {
    pub fn new(config: FecConfig) -> Self {
        let streams = (0..MAX_RADIO_STREAMS)
            .filter_map(StreamId::new)
            .map(|stream| StreamWindow::new(stream, config))
            .collect();
        Self { streams }
    }

    pub fn stream(&self, stream: StreamId) -> &StreamWindow {
        &self.streams[stream.index()]
    }

    pub fn set_profile(&mut self, stream: StreamId, profile: FecProfile) -> Result<(), FecError> {
        self.streams[stream.index()].set_profile(profile)
    }

    /// Stores one fragment of a block whose profile was configured for the stream.
    pub fn ingest(
        &mut self,
        stream: StreamId,
        block_index: u32,
        fragment_index: u8,
        is_parity: bool,
        bytes: &[u8],
    ) -> Result<Ingest, FecError> {
        self.streams[stream.index()].ingest(Fragment {
            block_index,
            fragment_index,
            is_parity: Some(is_parity),
            inline_profile: None,
            bytes,
        })
    }

    /// Stores a fragment straight from a packet payload (fragment header included).
    pub fn ingest_payload(&mut self, stream: StreamId, payload: &[u8]) -> Result<Ingest, FecError> {
        let window = &mut self.streams[stream.index()];
        let (header, bytes) = match FragmentHeader::parse(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                window.stats.rejected += 1;
                return Err(e);
            }
        };
        window.ingest(Fragment {
            block_index: header.block_index,
            fragment_index: header.fragment_index,
            is_parity: None,
            inline_profile: header.profile,
            bytes,
        })
    }

    pub fn try_emit(&mut self, stream: StreamId) -> Vec<RecoveredBlock> {
        self.streams[stream.index()].try_emit()
    }

    /// Emits ready blocks on every stream, lowest stream first.
    pub fn try_emit_all(&mut self) -> Vec<RecoveredBlock> {
        self.streams.iter_mut().flat_map(StreamWindow::try_emit).collect()
    }

    pub fn window_len(&self, stream: StreamId) -> usize {
        self.stream(stream).len()
    }

    pub fn stats(&self, stream: StreamId) -> FecStats {
        self.stream(stream).stats()
    }
}
