//! Registry of the IPC channel endpoints a process has open

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::SinkExt;
use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio::time::{timeout, Instant};
use tokio_util::codec::{Decoder, FramedWrite};

use crate::channel::ChannelType;
use crate::codec::{IpcCodec, IPC_CHANNEL_MAX_MSG_SIZE};
use crate::transport::Transport;
use crate::IpcError;

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum Endpoint<T: Transport> {
    Writer(FramedWrite<T::Writer, IpcCodec>),
    Reader {
        reader: T::Reader,
        buffer: BytesMut,
        codec: IpcCodec,
        error_streak: u32,
    },
}

struct OpenChannel<T: Transport> {
    channel: ChannelType,
    endpoint: Endpoint<T>,
}

impl<T: Transport> OpenChannel<T> {
    fn is_writer(&self) -> bool {
        matches!(self.endpoint, Endpoint::Writer(_))
    }
}

/// Owns every channel endpoint of one process. Not shared between tasks.
pub struct IpcHub<T: Transport> {
    transport: T,
    channels: HashMap<ChannelId, OpenChannel<T>>,
    next_id: u32,
    write_timeout: Duration,
    read_error_streak: u32,
    corrupt_frames: u64,
}

impl<T: Transport> IpcHub<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            channels: HashMap::new(),
            next_id: 1,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            read_error_streak: 0,
            corrupt_frames: 0,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    fn find(&self, channel: ChannelType, writer: bool) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|(_, open)| open.channel == channel && open.is_writer() == writer)
            .map(|(id, _)| *id)
    }

    fn register(&mut self, channel: ChannelType, endpoint: Endpoint<T>) -> ChannelId {
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        self.channels.insert(id, OpenChannel { channel, endpoint });
        id
    }

    pub fn open_write_endpoint(&mut self, channel: ChannelType) -> Result<ChannelId, IpcError> {
        if let Some(id) = self.find(channel, true) {
            return Ok(id);
        }
        let writer = self
            .transport
            .open_writer(channel)
            .map_err(|e| IpcError::ChannelUnavailable(channel, e))?;
        let id = self.register(channel, Endpoint::Writer(FramedWrite::new(writer, IpcCodec::new())));
        info!("[IPC] Opened write endpoint {} for channel {}", id, channel);
        Ok(id)
    }

    pub fn open_read_endpoint(&mut self, channel: ChannelType) -> Result<ChannelId, IpcError> {
        if let Some(id) = self.find(channel, false) {
            return Ok(id);
        }
        let reader = self
            .transport
            .open_reader(channel)
            .map_err(|e| IpcError::ChannelUnavailable(channel, e))?;
        let id = self.register(
            channel,
            Endpoint::Reader {
                reader,
                buffer: BytesMut::with_capacity(IPC_CHANNEL_MAX_MSG_SIZE * 2),
                codec: IpcCodec::new(),
                error_streak: 0,
            },
        );
        info!("[IPC] Opened read endpoint {} for channel {}", id, channel);
        Ok(id)
    }

    pub fn channel_type(&self, id: ChannelId) -> Option<ChannelType> {
        self.channels.get(&id).map(|open| open.channel)
    }

    /// Writes one whole message; a write that does not complete in time fails.
    pub async fn send(&mut self, id: ChannelId, message: &[u8]) -> Result<(), IpcError> {
        let open = self.channels.get_mut(&id).ok_or(IpcError::UnknownChannel(id))?;
        let channel = open.channel;
        let Endpoint::Writer(writer) = &mut open.endpoint else {
            return Err(IpcError::WrongDirection(channel));
        };

        match timeout(self.write_timeout, writer.send(Bytes::copy_from_slice(message))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(IpcError::Io(e))) => {
                warn!("[IPC] Failed to write to channel {}: {}", channel, e);
                Err(IpcError::WriteFailed(channel, e.to_string()))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("[IPC] Write to channel {} timed out", channel);
                Err(IpcError::WriteFailed(channel, "write timed out".into()))
            }
        }
    }

    /// Returns the next complete message, or `None` if none arrived within `wait`.
    ///
    /// Partial frames stay buffered for the next call. A corrupt frame clears the
    /// buffer and bumps the error counters; the channel stays usable.
    pub async fn try_read(&mut self, id: ChannelId, wait: Duration) -> Result<Option<Bytes>, IpcError> {
        let open = self.channels.get_mut(&id).ok_or(IpcError::UnknownChannel(id))?;
        let channel = open.channel;
        let Endpoint::Reader { reader, buffer, codec, error_streak } = &mut open.endpoint else {
            return Err(IpcError::WrongDirection(channel));
        };

        let deadline = Instant::now() + wait;
        loop {
            match codec.decode(buffer) {
                Ok(Some(message)) => {
                    *error_streak = 0;
                    self.read_error_streak = 0;
                    return Ok(Some(message.payload));
                }
                Ok(None) => {}
                Err(e) => {
                    buffer.clear();
                    *error_streak += 1;
                    self.read_error_streak += 1;
                    self.corrupt_frames += 1;
                    warn!(
                        "[IPC] Corrupt data on channel {} ({} in a row): {}",
                        channel, self.read_error_streak, e
                    );
                    return Err(e);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, reader.read_buf(buffer)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    debug!("[IPC] Channel {} reached end of stream", channel);
                    return Ok(None);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(IpcError::ChannelUnavailable(channel, e)),
            }
        }
    }

    /// Releases an endpoint. Closing an unknown or already closed id does nothing.
    pub fn close(&mut self, id: ChannelId) {
        if let Some(open) = self.channels.remove(&id) {
            info!("[IPC] Closed endpoint {} for channel {}", id, open.channel);
        }
    }

    pub fn close_all(&mut self) {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            self.close(id);
        }
    }

    /// Closes and reopens an endpoint in the same direction.
    pub fn reopen(&mut self, id: ChannelId) -> Result<ChannelId, IpcError> {
        let open = self.channels.get(&id).ok_or(IpcError::UnknownChannel(id))?;
        let (channel, writer) = (open.channel, open.is_writer());
        self.close(id);
        if writer {
            self.open_write_endpoint(channel)
        } else {
            self.open_read_endpoint(channel)
        }
    }

    /// Consecutive framing failures across all read endpoints, reset by any good read.
    pub fn read_error_streak(&self) -> u32 {
        self.read_error_streak
    }

    pub fn channel_error_streak(&self, id: ChannelId) -> u32 {
        match self.channels.get(&id).map(|open| &open.endpoint) {
            Some(Endpoint::Reader { error_streak, .. }) => *error_streak,
            _ => 0,
        }
    }

    pub fn corrupt_frames(&self) -> u64 {
        self.corrupt_frames
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }
}
