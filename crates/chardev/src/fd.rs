//! Descriptor-backed transports: fd pair, named pipe pair and raw file.
//!
//! The fd pair is the base the other two delegate to once their
//! descriptors are open.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::chardev::{ChrEvent, Chardev, Frontend, FrontendSlot, Interest};
use crate::error::{ChardevError, Result};

/// Upper bound on a single read from any descriptor.
pub(crate) const READ_BUF_LEN: usize = 4096;

/// Put a descriptor into non-blocking mode.
pub(crate) fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: fcntl on a descriptor we borrow for the duration of the call.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// One write attempt. A full kernel buffer counts as zero bytes accepted.
pub(crate) fn write_once(mut w: impl Write, buf: &[u8]) -> io::Result<usize> {
    loop {
        match w.write(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) => return Err(e),
        }
    }
}

/// Backend over a caller-supplied input/output descriptor pair.
///
/// Either side may be absent: a raw file has no input, and an input that
/// reached end of stream is released and never watched again.
pub struct FdChardev {
    input: Option<File>,
    output: Option<File>,
    frontend: FrontendSlot,
    max_read: usize,
    buf: Vec<u8>,
}

impl FdChardev {
    /// Wrap two descriptors. Both are switched to non-blocking mode.
    pub fn new(input: Option<OwnedFd>, output: Option<OwnedFd>) -> Result<Self> {
        if let Some(fd) = &input {
            set_nonblocking(fd.as_fd())?;
        }
        if let Some(fd) = &output {
            set_nonblocking(fd.as_fd())?;
        }
        Ok(FdChardev {
            input: input.map(File::from),
            output: output.map(File::from),
            frontend: FrontendSlot::new(),
            max_read: 0,
            buf: vec![0u8; READ_BUF_LEN],
        })
    }

    /// Open `<name>.in` / `<name>.out`, falling back to `<name>` for both
    /// directions when the pair does not exist.
    pub fn open_pipe(name: &str) -> Result<Self> {
        let in_path = format!("{name}.in");
        let out_path = format!("{name}.out");
        let pair = open_rdwr(Path::new(&in_path))
            .and_then(|i| open_rdwr(Path::new(&out_path)).map(|o| (i, o)));
        let (input, output) = match pair {
            Ok(pair) => pair,
            Err(err) => {
                tracing::debug!(name, error = %err, "pipe pair unavailable, using single path");
                let single = open_rdwr(Path::new(name)).map_err(|e| ChardevError::open(name, e))?;
                let dup = single.try_clone()?;
                (single, dup)
            }
        };
        Self::new(Some(input.into()), Some(output.into()))
    }

    /// Open `path` write-only, truncating. Input is disabled.
    pub fn open_file_out(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o666)
            .open(path)
            .map_err(|e| ChardevError::open(path, e))?;
        Self::new(None, Some(file.into()))
    }

    pub fn input_fd(&self) -> Option<RawFd> {
        self.input.as_ref().map(|f| f.as_raw_fd())
    }

    pub fn output_fd(&self) -> Option<RawFd> {
        self.output.as_ref().map(|f| f.as_raw_fd())
    }

    fn read_input(&mut self) {
        let len = self.max_read.min(self.buf.len());
        if len == 0 {
            return;
        }
        let Some(input) = self.input.as_mut() else {
            return;
        };
        match input.read(&mut self.buf[..len]) {
            Ok(0) => {
                tracing::debug!("fd input reached end of stream");
                self.input = None;
                self.frontend.event(ChrEvent::Closed);
            }
            Ok(n) => self.frontend.deliver(&self.buf[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
            Err(e) => tracing::warn!(error = %e, "fd read failed"),
        }
    }
}

fn open_rdwr(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

impl Chardev for FdChardev {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.output.as_mut() {
            Some(out) => write_once(out, buf),
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
        self.input = None;
        self.output = None;
    }

    fn interest(&mut self) -> Interest {
        self.max_read = self.frontend.read_capacity();
        match self.input_fd() {
            Some(fd) if self.max_read > 0 => Interest::read(fd),
            _ => Interest::default(),
        }
    }

    fn on_readable(&mut self, _fd: RawFd) {
        self.read_input();
    }
}
