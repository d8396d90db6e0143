//! Stream-socket backend (TCP or Unix), listening or connecting, with an
//! optional inline Telnet filter.
//!
//! A listener serves one peer at a time: while a peer is attached the
//! listening socket is not watched, and when the peer hangs up the
//! backend goes back to accepting. Writes with no peer attached are
//! accepted and dropped so the guest never blocks on a missing client.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::chardev::{ChrEvent, Chardev, Frontend, FrontendSlot, Interest};
use crate::error::{ChardevError, Result};
use crate::fd::{write_once, READ_BUF_LEN};
use crate::telnet::{TelnetFilter, SERVER_PREAMBLE};

/// Where a stream socket lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketAddress {
    /// `host:port`
    Tcp(String),
    Unix(PathBuf),
}

impl std::fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketAddress::Tcp(addr) => write!(f, "tcp:{addr}"),
            SocketAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// Listen for a peer instead of connecting out.
    pub server: bool,
    /// Block in the constructor until the first peer connects.
    pub wait: bool,
    pub telnet: bool,
    pub nodelay: bool,
}

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nonblocking(true),
            Stream::Unix(s) => s.set_nonblocking(true),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    fn bind(addr: &SocketAddress) -> Result<Self> {
        let bind_err = |source| ChardevError::Bind {
            addr: addr.to_string(),
            source,
        };
        match addr {
            SocketAddress::Tcp(hostport) => {
                TcpListener::bind(hostport.as_str()).map(Listener::Tcp).map_err(bind_err)
            }
            SocketAddress::Unix(path) => {
                // a stale socket file from a previous run would make bind fail
                let _ = fs::remove_file(path);
                let listener = UnixListener::bind(path).map_err(bind_err)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    fn accept(&self) -> io::Result<Stream> {
        match self {
            Listener::Tcp(l) => l.accept().map(|(s, _)| Stream::Tcp(s)),
            Listener::Unix { listener, .. } => listener.accept().map(|(s, _)| Stream::Unix(s)),
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.set_nonblocking(nonblocking),
            Listener::Unix { listener, .. } => listener.set_nonblocking(nonblocking),
        }
    }

    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix { listener, .. } => listener.as_raw_fd(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = fs::remove_file(path);
        }
    }
}

fn accept_blocking(listener: &Listener, addr: &SocketAddress) -> Result<Stream> {
    loop {
        match listener.accept() {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(ChardevError::Accept {
                    addr: addr.to_string(),
                    source,
                })
            }
        }
    }
}

pub struct SocketChardev {
    stream: Option<Stream>,
    listener: Option<Listener>,
    telnet: TelnetFilter,
    nodelay: bool,
    frontend: FrontendSlot,
    max_read: usize,
    buf: Vec<u8>,
}

impl SocketChardev {
    pub fn open(addr: &SocketAddress, opts: SocketOptions) -> Result<Self> {
        if opts.server {
            Self::listen(addr, opts)
        } else {
            Self::connect(addr, opts)
        }
    }

    pub fn listen(addr: &SocketAddress, opts: SocketOptions) -> Result<Self> {
        let listener = Listener::bind(addr)?;
        let mut dev = Self::unattached(opts);
        if opts.wait {
            tracing::info!(%addr, "waiting for connection");
            let stream = accept_blocking(&listener, addr)?;
            listener.set_nonblocking(true)?;
            dev.listener = Some(listener);
            dev.attach(stream);
        } else {
            listener.set_nonblocking(true)?;
            tracing::info!(%addr, "listening");
            dev.listener = Some(listener);
        }
        Ok(dev)
    }

    pub fn connect(addr: &SocketAddress, opts: SocketOptions) -> Result<Self> {
        let connect_err = |source| ChardevError::Connect {
            addr: addr.to_string(),
            source,
        };
        let stream = match addr {
            SocketAddress::Tcp(hostport) => {
                Stream::Tcp(TcpStream::connect(hostport.as_str()).map_err(connect_err)?)
            }
            SocketAddress::Unix(path) => Stream::Unix(UnixStream::connect(path).map_err(connect_err)?),
        };
        let mut dev = Self::unattached(opts);
        dev.attach(stream);
        tracing::info!(%addr, "connected");
        Ok(dev)
    }

    fn unattached(opts: SocketOptions) -> Self {
        SocketChardev {
            stream: None,
            listener: None,
            telnet: TelnetFilter::new(opts.telnet),
            nodelay: opts.nodelay,
            frontend: FrontendSlot::new(),
            max_read: 0,
            buf: Vec::with_capacity(READ_BUF_LEN),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Bound TCP address of a listening backend.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Some(Listener::Tcp(l)) => l.local_addr().ok(),
            _ => None,
        }
    }

    fn attach(&mut self, mut stream: Stream) {
        if let Err(e) = stream.set_nonblocking() {
            tracing::warn!(error = %e, "failed to make peer socket non-blocking");
        }
        if let (true, Stream::Tcp(s)) = (self.nodelay, &stream) {
            let _ = s.set_nodelay(true);
        }
        self.telnet.reset();
        if self.telnet.is_enabled() && self.listener.is_some() {
            if let Err(e) = write_once(&mut stream, &SERVER_PREAMBLE) {
                tracing::debug!(error = %e, "telnet preamble not sent");
            }
        }
        self.stream = Some(stream);
        self.frontend.event(ChrEvent::Reset);
    }

    fn accept_pending(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        let stream = loop {
            match listener.accept() {
                Ok(stream) => break stream,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        tracing::debug!(error = %e, "accept failed");
                    }
                    return;
                }
            }
        };
        tracing::info!("peer connected");
        self.attach(stream);
    }

    fn detach(&mut self) {
        self.stream = None;
        self.telnet.reset();
        if self.listener.is_some() {
            tracing::info!("peer disconnected, accepting again");
        } else {
            tracing::info!("peer disconnected");
        }
        self.frontend.event(ChrEvent::Closed);
    }

    fn read_stream(&mut self) {
        let len = self.max_read.min(READ_BUF_LEN);
        if len == 0 {
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        self.buf.resize(len, 0);
        match stream.read(&mut self.buf) {
            Ok(0) => self.detach(),
            Ok(n) => {
                self.buf.truncate(n);
                for _ in 0..self.telnet.filter(&mut self.buf) {
                    self.frontend.event(ChrEvent::Break);
                }
                if !self.buf.is_empty() {
                    self.frontend.deliver(&self.buf);
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
            Err(e) => {
                tracing::debug!(error = %e, "socket read failed");
                self.detach();
            }
        }
    }
}

impl Chardev for SocketChardev {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => write_once(stream, buf),
            None => Ok(buf.len()),
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
        self.stream = None;
        self.listener = None;
    }

    fn interest(&mut self) -> Interest {
        if let Some(stream) = &self.stream {
            let fd = stream.as_raw_fd();
            self.max_read = self.frontend.read_capacity();
            if self.max_read > 0 {
                return Interest::read(fd);
            }
            return Interest::default();
        }
        match &self.listener {
            Some(listener) => Interest::read(listener.as_raw_fd()),
            None => Interest::default(),
        }
    }

    fn on_readable(&mut self, fd: RawFd) {
        match (&self.stream, &self.listener) {
            (Some(stream), _) if stream.as_raw_fd() == fd => self.read_stream(),
            (None, Some(listener)) if listener.as_raw_fd() == fd => self.accept_pending(),
            _ => {}
        }
    }
}
