//! Wire format and configuration model shared by every fpvlink process

pub mod checksum;
pub mod model;
pub mod packet;
pub mod radio_params;
pub mod types;

pub use model::{FecProfile, ModelError, ModelStore, VehicleModel};
pub use packet::{decode, decode_chain, encode, CodecError, Packet, PacketChain, PacketHeader};
pub use radio_params::{DataRate, FrameFlags, LinkCapabilities, TransmitConfig, TxSettings};
pub use types::{Component, StreamId, VehicleId};
