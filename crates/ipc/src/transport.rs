//! Byte transports underneath the IPC channels

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::unix::pipe;

use crate::channel::ChannelType;
use crate::codec::IPC_CHANNEL_MAX_MSG_SIZE;

/// Creates the byte streams a channel endpoint reads from or writes to.
pub trait Transport {
    type Reader: AsyncRead + Unpin;
    type Writer: AsyncWrite + Unpin;

    fn open_reader(&mut self, channel: ChannelType) -> io::Result<Self::Reader>;
    fn open_writer(&mut self, channel: ChannelType) -> io::Result<Self::Writer>;
}

/// Named pipes in a runtime directory, one per channel type.
///
/// Must be used from within a tokio runtime.
pub struct FifoTransport {
    dir: PathBuf,
}

impl FifoTransport {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, channel: ChannelType) -> PathBuf {
        self.dir.join(channel.fifo_name())
    }

    fn ensure_fifo(&self, channel: ChannelType) -> io::Result<PathBuf> {
        use nix::sys::stat::Mode;

        let path = self.path(channel);
        if !path.exists() {
            nix::unistd::mkfifo(&path, Mode::from_bits_truncate(0o666))?;
            info!("[IPC] Created FIFO {}", path.display());
        }
        Ok(path)
    }

    /// Removes every channel FIFO.
    pub fn remove_all(&self) -> io::Result<()> {
        for channel in ChannelType::ALL {
            let path = self.path(channel);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn options() -> pipe::OpenOptions {
        let mut options = pipe::OpenOptions::new();
        // keeps both ends usable while the peer process restarts
        #[cfg(target_os = "linux")]
        options.read_write(true);
        options
    }
}

impl Transport for FifoTransport {
    type Reader = pipe::Receiver;
    type Writer = pipe::Sender;

    fn open_reader(&mut self, channel: ChannelType) -> io::Result<Self::Reader> {
        let path = self.ensure_fifo(channel)?;
        Self::options().open_receiver(path)
    }

    fn open_writer(&mut self, channel: ChannelType) -> io::Result<Self::Writer> {
        let path = self.ensure_fifo(channel)?;
        Self::options().open_sender(path)
    }
}

#[derive(Default)]
struct PipeSlot {
    reader: Option<DuplexStream>,
    writer: Option<DuplexStream>,
}

/// In-process pipes; clones share the same set of channels.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    pipes: Arc<Mutex<HashMap<ChannelType, PipeSlot>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn take(&self, channel: ChannelType, reader: bool) -> io::Result<DuplexStream> {
        let mut pipes = self
            .pipes
            .lock()
            .map_err(|_| io::Error::other("memory transport lock poisoned"))?;
        let slot = pipes.entry(channel).or_default();
        let end = if reader { &mut slot.reader } else { &mut slot.writer };
        if let Some(stream) = end.take() {
            return Ok(stream);
        }

        // both ends of the previous pipe were handed out: start a fresh one
        debug!("[IPC] Creating in-memory pipe for {}", channel);
        let (write_end, read_end) = tokio::io::duplex(IPC_CHANNEL_MAX_MSG_SIZE * 8);
        if reader {
            slot.writer = Some(write_end);
            Ok(read_end)
        } else {
            slot.reader = Some(read_end);
            Ok(write_end)
        }
    }
}

impl Transport for MemoryTransport {
    type Reader = DuplexStream;
    type Writer = DuplexStream;

    fn open_reader(&mut self, channel: ChannelType) -> io::Result<Self::Reader> {
        self.take(channel, true)
    }

    fn open_writer(&mut self, channel: ChannelType) -> io::Result<Self::Writer> {
        self.take(channel, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memory_transport_connects_ends() {
        let mut router = MemoryTransport::new();
        let mut telemetry = router.clone();

        let mut writer = router.open_writer(ChannelType::RouterToTelemetry).unwrap();
        let mut reader = telemetry.open_reader(ChannelType::RouterToTelemetry).unwrap();
        writer.write_all(b"abc").await.unwrap();

        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_fifo_transport_round_trip() {
        let dir = std::env::temp_dir().join(format!("fpvlink-ipc-{}", std::process::id()));
        let mut transport = FifoTransport::new(&dir).unwrap();

        let mut reader = transport.open_reader(ChannelType::RcToRouter).unwrap();
        let mut writer = transport.open_writer(ChannelType::RcToRouter).unwrap();
        assert!(transport.path(ChannelType::RcToRouter).exists());

        writer.write_all(b"rc frame").await.unwrap();
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"rc frame");

        transport.remove_all().unwrap();
        assert!(!transport.path(ChannelType::RcToRouter).exists());
        std::fs::remove_dir(&dir).unwrap();
    }
}
