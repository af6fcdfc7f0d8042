//! Activity timestamps read by the external watchdog

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
struct Inner {
    last_active_ms: AtomicU64,
    last_ipc_incoming_ms: AtomicU64,
    last_ipc_outgoing_ms: AtomicU64,
    last_radio_rx_ms: AtomicU64,
    last_radio_tx_ms: AtomicU64,
    ticks: AtomicU64,
    alarms: AtomicU64,
}

/// Cheap to clone; every clone sees the same timestamps.
#[derive(Debug, Clone, Default)]
pub struct ProcessStats {
    inner: Arc<Inner>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub last_active_ms: u64,
    pub last_ipc_incoming_ms: u64,
    pub last_ipc_outgoing_ms: u64,
    pub last_radio_rx_ms: u64,
    pub last_radio_tx_ms: u64,
    pub ticks: u64,
    pub alarms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ProcessStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) {
        self.inner.ticks.fetch_add(1, Ordering::Relaxed);
        self.inner.last_active_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn ipc_incoming(&self) {
        self.inner.last_ipc_incoming_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn ipc_outgoing(&self) {
        self.inner.last_ipc_outgoing_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn radio_rx(&self) {
        self.inner.last_radio_rx_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn radio_tx(&self) {
        self.inner.last_radio_tx_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn alarm(&self) {
        self.inner.alarms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = &self.inner;
        StatsSnapshot {
            last_active_ms: inner.last_active_ms.load(Ordering::Relaxed),
            last_ipc_incoming_ms: inner.last_ipc_incoming_ms.load(Ordering::Relaxed),
            last_ipc_outgoing_ms: inner.last_ipc_outgoing_ms.load(Ordering::Relaxed),
            last_radio_rx_ms: inner.last_radio_rx_ms.load(Ordering::Relaxed),
            last_radio_tx_ms: inner.last_radio_tx_ms.load(Ordering::Relaxed),
            ticks: inner.ticks.load(Ordering::Relaxed),
            alarms: inner.alarms.load(Ordering::Relaxed),
        }
    }

    /// Milliseconds since the loop last completed a tick, `None` before the first one.
    pub fn idle_for_ms(&self) -> Option<u64> {
        match self.inner.last_active_ms.load(Ordering::Relaxed) {
            0 => None,
            last => Some(now_ms().saturating_sub(last)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_timestamps() {
        let stats = ProcessStats::new();
        let watchdog = stats.clone();
        assert_eq!(watchdog.idle_for_ms(), None);

        stats.tick();
        stats.radio_tx();
        stats.alarm();
        let snapshot = watchdog.snapshot();
        assert_eq!(snapshot.ticks, 1);
        assert_eq!(snapshot.alarms, 1);
        assert!(snapshot.last_active_ms > 0);
        assert!(snapshot.last_radio_tx_ms >= snapshot.last_active_ms);
        assert_eq!(snapshot.last_radio_rx_ms, 0);
        assert!(watchdog.idle_for_ms().unwrap() < 60_000);
    }
}
