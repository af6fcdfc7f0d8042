use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use fpvlink_radio::{FecConfig, NegotiationTimeouts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Vehicle,
    Controller,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcSettings {
    pub dir: PathBuf,
    pub read_timeout_ms: u64,
    /// Consecutive corrupt frames on one channel before it is reopened.
    pub max_read_errors: u32,
    /// Messages drained per input channel per tick.
    pub max_messages_per_tick: usize,
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/tmp/fpvlink"),
            read_timeout_ms: 2,
            max_read_errors: 10,
            max_messages_per_tick: 32,
        }
    }
}

/// A UDP radio and the model interface it stands in for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioBinding {
    pub name: String,
    /// Index into the model's radio interfaces.
    pub interface: usize,
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub role: Role,
    pub tick_interval_ms: u64,
    pub model_path: PathBuf,
    pub outbound_queue_capacity: usize,
    pub ipc: IpcSettings,
    pub fec: FecConfig,
    pub negotiation: NegotiationTimeouts,
    pub radios: Vec<RadioBinding>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            role: Role::Vehicle,
            tick_interval_ms: 5,
            model_path: PathBuf::from("/etc/fpvlink/model.toml"),
            outbound_queue_capacity: 256,
            ipc: IpcSettings::default(),
            fec: FecConfig::default(),
            negotiation: NegotiationTimeouts::default(),
            radios: Vec::new(),
        }
    }
}

impl RouterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading router config {}", path.display()))?;
        let config: RouterConfig = toml::from_str(&contents)
            .with_context(|| format!("parsing router config {}", path.display()))?;
        Ok(config)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn ipc_read_timeout(&self) -> Duration {
        Duration::from_millis(self.ipc.read_timeout_ms)
    }
}
