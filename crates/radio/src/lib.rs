//! Radio side of the fpvlink transport: erasure-coded blocks, link negotiation,
//! relaying and the radio interfaces packets leave through

use thiserror::Error;

pub mod fec;
pub mod interface;
pub mod negotiate;
pub mod queue;
pub mod relay;
pub mod simulated;
pub mod udp;

pub use fec::{FecConfig, FecEncoder, FecError, FecReconstructor, FecStats, Ingest, RecoveredBlock};
pub use interface::{OutboundFrame, RadioInterface, RadioInterfaces, RadioPort, TxAccounting};
pub use negotiate::{
    NegotiationCommand, NegotiationEvent, NegotiationMessage, NegotiationTimeouts, Negotiator,
    RevertReason,
};
pub use queue::PacketQueue;
pub use relay::{RelayError, RelayForwarder, RelayOutcome};
pub use simulated::{LinkConditions, SimulatedRadio};
pub use udp::UdpRadio;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("Frame of {0} bytes too large for radio MTU")]
    PacketTooLarge(usize),

    #[error("Radio interface {0} is not open for writing")]
    NotOpen(String),

    #[error("Radio transmission failed: {0}")]
    TransmissionFailed(String),

    #[error("Invalid frame format")]
    InvalidFrame,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
