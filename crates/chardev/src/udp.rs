//! Datagram backend bound to a local endpoint with a fixed peer.
//!
//! Datagram boundaries are not preserved toward the consumer: each
//! datagram is handed up one byte at a time, re-checking capacity before
//! every byte, and whatever does not fit waits for the next poll.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

use crate::chardev::{Chardev, Frontend, FrontendSlot, Interest};
use crate::error::{ChardevError, Result};
use crate::fd::READ_BUF_LEN;

pub struct UdpChardev {
    /// `None` once closed.
    socket: Option<UdpSocket>,
    peer: SocketAddr,
    frontend: FrontendSlot,
    buf: Vec<u8>,
}

impl UdpChardev {
    pub fn new(local: SocketAddr, peer: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).map_err(|source| ChardevError::Bind {
            addr: local.to_string(),
            source,
        })?;
        socket.set_nonblocking(true)?;
        tracing::debug!(local = %socket.local_addr()?, %peer, "udp chardev bound");
        Ok(UdpChardev {
            socket: Some(socket),
            peer,
            frontend: FrontendSlot::new(),
            buf: vec![0u8; READ_BUF_LEN],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.socket {
            Some(socket) => socket.local_addr(),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl Chardev for UdpChardev {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(socket) = &self.socket else {
            return Ok(buf.len());
        };
        match socket.send_to(buf, self.peer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn set_frontend(&mut self, frontend: Box<dyn Frontend>) -> Result<()> {
        self.frontend.set(frontend);
        Ok(())
    }

    fn accept_input(&mut self) {
        self.frontend.flush();
    }

    fn close(&mut self) {
        self.socket = None;
    }

    fn interest(&mut self) -> Interest {
        match &self.socket {
            Some(socket) if self.frontend.read_capacity() > 0 => Interest::read(socket.as_raw_fd()),
            _ => Interest::default(),
        }
    }

    fn on_readable(&mut self, _fd: RawFd) {
        let Some(socket) = &self.socket else {
            return;
        };
        match socket.recv(&mut self.buf) {
            Ok(0) => {}
            Ok(n) => self.frontend.deliver_each(&self.buf[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
            Err(e) => tracing::debug!(error = %e, "udp recv failed"),
        }
    }
}
