//! UDP-backed radio interface for bench setups
//!
//! Each datagram is one radio frame: a router port byte followed by the packet chain.
//! The modulation settings cannot be expressed over UDP and are only logged.
//!
//! The socket is registered with the tokio reactor but driven through `try_*` calls, so
//! datagrams become visible once the runtime has polled the reactor, at the latest on the
//! next router tick.

use std::io::ErrorKind;
use std::net::SocketAddr;

use log::{info, trace, warn};
use tokio::net::UdpSocket;

use crate::interface::{OutboundFrame, RadioInterface, RadioPort};
use crate::RadioError;

const MAX_DATAGRAM_SIZE: usize = 4096;

pub struct UdpRadio {
    name: String,
    socket: UdpSocket,
    peer: SocketAddr,
    open: bool,
}

impl UdpRadio {
    pub async fn bind(name: &str, local: SocketAddr, peer: SocketAddr) -> Result<Self, RadioError> {
        let socket = UdpSocket::bind(local).await?;
        socket.writable().await?;
        info!("Radio interface {} bound to {} (peer {})", name, socket.local_addr()?, peer);
        Ok(Self { name: name.to_string(), socket, peer, open: true })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RadioError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn close(&mut self) {
        self.open = false;
    }
}

impl RadioInterface for UdpRadio {
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
        let mut datagram = Vec::with_capacity(frame.payload.len() + 1);
        datagram.push(frame.port.byte());
        datagram.extend_from_slice(&frame.payload);
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(RadioError::PacketTooLarge(datagram.len()));
        }

        let written = match self.socket.try_send_to(&datagram, self.peer) {
            Ok(written) => written,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Err(RadioError::TransmissionFailed(format!("{}: send buffer full", self.name)));
            }
            Err(e) => return Err(e.into()),
        };
        if written != datagram.len() {
            return Err(RadioError::TransmissionFailed(format!(
                "partial write of {} of {} bytes",
                written,
                datagram.len()
            )));
        }
        trace!("{}: sent {} bytes ({})", self.name, written, frame.settings.datarate);
        Ok(())
    }

    fn try_receive(&mut self) -> Result<Option<Vec<u8>>, RadioError> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((len, from)) => {
                    if len < 2 || RadioPort::from_byte(buf[0]).is_none() {
                        warn!("{}: dropping malformed datagram of {} bytes from {}", self.name, len, from);
                        continue;
                    }
                    return Ok(Some(buf[1..len].to_vec()));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}
