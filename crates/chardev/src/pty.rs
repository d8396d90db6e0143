//! Pseudo-terminal backend whose peer may come and go.
//!
//! Nothing tells the master side that a program opened or closed the
//! slave, so the link state is inferred: reads failing with `EIO` mean
//! nobody holds the slave, and a short quiet spell while polling means
//! somebody does. The three link states each own exactly one timer
//! interval, set in [`PtyChardev::enter`].

use std::ffi::{CStr, OsStr};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::termios::{self, SetArg};

use crate::chardev::{ChrEvent, Chardev, Frontend, FrontendSlot, Interest};
use crate::error::Result;
use crate::fd::{set_nonblocking, write_once, READ_BUF_LEN};

/// Re-check interval while waiting for a peer that may have just arrived.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Back-off once the peer is known to be gone.
pub const IDLE_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Connected,
    /// Watching the master and about to conclude the peer is present.
    Polling,
    /// Peer absent; the master is not watched until the timer expires.
    Idle,
}

/// Path of the terminal device behind `fd`.
pub fn tty_path(fd: impl AsFd) -> io::Result<PathBuf> {
    let mut buf = [0 as libc::c_char; 128];
    // SAFETY: ttyname_r writes a NUL-terminated name into buf, bounded by its length.
    let rc = unsafe { libc::ttyname_r(fd.as_fd().as_raw_fd(), buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    // SAFETY: on success buf holds a NUL-terminated string.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(PathBuf::from(OsStr::from_bytes(name.to_bytes())))
}

pub struct PtyChardev {
    master: Option<File>,
    name: PathBuf,
    link: Link,
    deadline: Option<Instant>,
    frontend: FrontendSlot,
    max_read: usize,
    buf: Vec<u8>,
}

impl PtyChardev {
    /// Allocate a fresh pair. The slave is put in raw mode and closed
    /// again; guests' users open it by name.
    pub fn open() -> Result<Self> {
        let pair = nix::pty::openpty(None, None)?;
        let mut tio = termios::tcgetattr(&pair.slave)?;
        termios::cfmakeraw(&mut tio);
        termios::tcsetattr(&pair.slave, SetArg::TCSANOW, &tio)?;
        let name = tty_path(&pair.slave)?;
        drop(pair.slave);

        set_nonblocking(pair.master.as_fd())?;
        tracing::info!(path = %name.display(), "char device redirected to pty");

        let mut dev = PtyChardev {
            master: Some(File::from(pair.master)),
            name,
            link: Link::Polling,
            deadline: None,
            frontend: FrontendSlot::new(),
            max_read: 0,
            buf: vec![0u8; READ_BUF_LEN],
        };
        dev.enter(Link::Polling);
        Ok(dev)
    }

    /// Slave device path, e.g. `/dev/pts/3`.
    pub fn pty_name(&self) -> &Path {
        &self.name
    }

    pub fn link(&self) -> Link {
        self.link
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn enter(&mut self, link: Link) {
        if link != self.link {
            tracing::debug!(path = %self.name.display(), from = ?self.link, to = ?link, "pty link change");
        }
        self.link = link;
        self.deadline = match link {
            Link::Connected => None,
            Link::Polling => Some(Instant::now() + POLL_INTERVAL),
            Link::Idle => Some(Instant::now() + IDLE_INTERVAL),
        };
    }

    fn connect(&mut self) {
        self.enter(Link::Connected);
        tracing::info!(path = %self.name.display(), "pty peer connected");
        self.frontend.event(ChrEvent::Reset);
    }

    fn hang_up(&mut self) {
        if self.link == Link::Connected {
            tracing::info!(path = %self.name.display(), "pty peer disconnected");
        }
        self.enter(Link::Idle);
    }

    fn read_master(&mut self) {
        let len = self.max_read.min(self.buf.len());
        if len == 0 {
            return;
        }
        let res = match self.master.as_mut() {
            Some(master) => master.read(&mut self.buf[..len]),
            None => return,
        };
        match res {
            Ok(0) => self.hang_up(),
            Ok(n) => {
                if self.link != Link::Connected {
                    self.connect();
                }
                self.frontend.deliver(&self.buf[..n]);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
            Err(e) => {
                if e.raw_os_error() != Some(libc::EIO) {
                    tracing::debug!(error = %e, "pty read failed");
                }
                self.hang_up();
            }
        }
    }
}

impl Chardev for PtyChardev {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.link != Link::Connected {
            // nobody to talk to: go look for a peer instead
            if self.link == Link::Idle {
                self.enter(Link::Polling);
            }
            return Ok(0);
        }
        match self.master.as_mut() {
            Some(master) => write_once(master, buf),
            None => Ok(0),
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
        self.deadline = None;
        self.master = None;
    }

    fn interest(&mut self) -> Interest {
        let Some(master) = &self.master else {
            return Interest::default();
        };
        let fd = master.as_raw_fd();
        self.max_read = self.frontend.read_capacity();
        let readable = match self.link {
            Link::Idle => None,
            _ if self.max_read > 0 => Some(fd),
            _ => None,
        };
        Interest {
            readable,
            deadline: self.deadline,
        }
    }

    fn on_readable(&mut self, _fd: RawFd) {
        self.read_master();
    }

    fn on_timer(&mut self, _now: Instant) {
        match self.link {
            Link::Idle => self.enter(Link::Polling),
            // still no EIO after a poll interval: the slave is held open
            Link::Polling => self.connect(),
            Link::Connected => self.deadline = None,
        }
    }
}
