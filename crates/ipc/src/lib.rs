//! Framed, typed, directional message pipes between the fpvlink processes

use thiserror::Error;

pub mod channel;
pub mod codec;
pub mod hub;
pub mod transport;

pub use channel::ChannelType;
pub use codec::{IpcCodec, IpcMessage, IPC_CHANNEL_MAX_MSG_SIZE};
pub use hub::{ChannelId, IpcHub};
pub use transport::{FifoTransport, MemoryTransport, Transport};

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("channel {0} unavailable: {1}")]
    ChannelUnavailable(ChannelType, std::io::Error),

    #[error("write to channel {0} failed: {1}")]
    WriteFailed(ChannelType, String),

    #[error("corrupt stream: {0}")]
    CorruptStream(String),

    #[error("unknown channel id {0}")]
    UnknownChannel(ChannelId),

    #[error("channel {0} is not open in that direction")]
    WrongDirection(ChannelType),

    #[error("message of {0} bytes exceeds the channel frame size")]
    MessageTooLarge(usize),

    #[error("empty messages cannot be sent")]
    EmptyMessage,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
