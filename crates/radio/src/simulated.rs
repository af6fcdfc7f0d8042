//! Simulated radio link for tests and the link simulator

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use fpvlink_core::types::MAX_PACKET_TOTAL_SIZE;
use fpvlink_core::TxSettings;

use crate::interface::{OutboundFrame, RadioInterface, RadioPort};
use crate::RadioError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConditions {
    pub mtu: usize,
    /// Average probability of losing a frame.
    pub packet_loss: f32,
    /// Loss comes in bursts instead of being independent per frame.
    pub bursty: bool,
    /// Probability that a delivered frame has one byte flipped.
    pub corruption: f32,
    pub seed: Option<u64>,
}

impl LinkConditions {
    pub fn perfect() -> Self {
        Self { packet_loss: 0.0, bursty: false, corruption: 0.0, ..Default::default() }
    }
}

impl Default for LinkConditions {
    fn default() -> Self {
        Self {
            mtu: MAX_PACKET_TOTAL_SIZE * 2,
            packet_loss: 0.15,
            bursty: true,
            corruption: 0.0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub frames_corrupted: u64,
    pub bytes_sent: u64,
    pub last_port: Option<RadioPort>,
    pub last_settings: Option<TxSettings>,
}

type Air = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// One end of a simulated point-to-point link.
pub struct SimulatedRadio {
    name: String,
    conditions: LinkConditions,
    inbox: Air,
    peer_inbox: Air,
    stats: Arc<Mutex<SimulatedStats>>,
    rng: StdRng,
    open: bool,
}

impl SimulatedRadio {
    /// Two connected endpoints sharing the same link conditions.
    pub fn pair(name: &str, conditions: LinkConditions) -> (SimulatedRadio, SimulatedRadio) {
        let a: Air = Arc::new(Mutex::new(VecDeque::new()));
        let b: Air = Arc::new(Mutex::new(VecDeque::new()));
        let seed = conditions.seed;
        let near = Self::endpoint(format!("{}-a", name), conditions.clone(), a.clone(), b.clone(), seed);
        let far = Self::endpoint(format!("{}-b", name), conditions, b, a, seed.map(|s| s.wrapping_add(1)));
        (near, far)
    }

    fn endpoint(name: String, conditions: LinkConditions, inbox: Air, peer_inbox: Air, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self {
            name,
            conditions,
            inbox,
            peer_inbox,
            stats: Arc::new(Mutex::new(SimulatedStats::default())),
            rng,
            open: true,
        }
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    /// Shared handle to this endpoint's transmit statistics.
    pub fn stats_handle(&self) -> Arc<Mutex<SimulatedStats>> {
        self.stats.clone()
    }

    pub fn stats(&self) -> SimulatedStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Loss probability for the next frame, scaled by a bursty multiplier.
    fn loss_probability(&mut self) -> f64 {
        let base = (self.conditions.packet_loss as f64).clamp(0.0, 1.0);
        // a dead or perfect link stays that way
        if !self.conditions.bursty || base == 0.0 || base == 1.0 {
            return base;
        }
        let r: f64 = self.rng.random();
        let multiplier = if r < 0.7 {
            0.8 + (r / 0.7) * 0.4
        } else if r < 0.95 {
            1.2 + ((r - 0.7) / 0.25) * 0.6
        } else {
            2.0 + ((r - 0.95) / 0.05) * 1.0
        };
        (base * multiplier).min(1.0)
    }
}

impl RadioInterface for SimulatedRadio {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open_for_write(&self) -> bool {
        self.open
    }

    fn write_frame(&mut self, frame: &OutboundFrame) -> Result<(), RadioError> {
        if !self.open {
            return Err(RadioError::NotOpen(self.name.clone()));
        }
        if frame.payload.len() > self.conditions.mtu {
            return Err(RadioError::PacketTooLarge(frame.payload.len()));
        }

        let drop_frame = self.rng.random::<f64>() < self.loss_probability();
        let corrupt = !drop_frame && self.rng.random::<f32>() < self.conditions.corruption;
        let mut data = frame.payload.to_vec();
        if corrupt && !data.is_empty() {
            let at = self.rng.random_range(0..data.len());
            data[at] ^= 0xFF;
        }

        {
            let mut stats = self
                .stats
                .lock()
                .map_err(|_| RadioError::TransmissionFailed("stats lock poisoned".into()))?;
            stats.frames_sent += 1;
            stats.bytes_sent += data.len() as u64;
            stats.last_port = Some(frame.port);
            stats.last_settings = Some(frame.settings);
            if drop_frame {
                stats.frames_dropped += 1;
            }
            if corrupt {
                stats.frames_corrupted += 1;
            }
        }

        if drop_frame {
            debug!("Simulated packet loss on {}", self.name);
            return Ok(());
        }
        trace!("Simulating radio transmission of {} bytes on {}", data.len(), self.name);
        self.peer_inbox
            .lock()
            .map_err(|_| RadioError::TransmissionFailed("link lock poisoned".into()))?
            .push_back(data);
        Ok(())
    }

    fn try_receive(&mut self) -> Result<Option<Vec<u8>>, RadioError> {
        let mut inbox = self
            .inbox
            .lock()
            .map_err(|_| RadioError::TransmissionFailed("link lock poisoned".into()))?;
        Ok(inbox.pop_front())
    }
}
