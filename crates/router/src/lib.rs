//! The radio router process: moves packets between the radio interfaces and the
//! telemetry, RC, command and central processes

pub mod config;
pub mod dispatch;
pub mod stats;

pub use config::{RadioBinding, RouterConfig, Role};
pub use dispatch::{Router, RouterError, TickReport};
pub use stats::{ProcessStats, StatsSnapshot};
