//! Backend over the process's own stdin/stdout.
//!
//! There is only one stdin per process, so at most one `StdioChardev` may
//! exist at a time; constructing a second one fails with
//! [`ChardevError::StdioBusy`] until the first is closed or dropped. Putting the
//! controlling terminal into raw mode is left to the caller.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::chardev::{ChrEvent, Chardev, Frontend, FrontendSlot, Interest};
use crate::error::{ChardevError, Result};
use crate::fd::write_once;

static STDIO_CLAIMED: AtomicBool = AtomicBool::new(false);

pub struct StdioChardev {
    /// Both `None` once closed.
    stdin: Option<File>,
    stdout: Option<File>,
    frontend: FrontendSlot,
    /// One byte read while the consumer had no room.
    pending: Option<u8>,
    eof: bool,
}

impl StdioChardev {
    pub fn new() -> Result<Self> {
        if STDIO_CLAIMED.swap(true, Ordering::AcqRel) {
            return Err(ChardevError::StdioBusy);
        }
        let dup = || -> io::Result<(File, File)> {
            let stdin = io::stdin().as_fd().try_clone_to_owned()?;
            let stdout = io::stdout().as_fd().try_clone_to_owned()?;
            Ok((File::from(stdin), File::from(stdout)))
        };
        match dup() {
            Ok((stdin, stdout)) => Ok(StdioChardev {
                stdin: Some(stdin),
                stdout: Some(stdout),
                frontend: FrontendSlot::new(),
                pending: None,
                eof: false,
            }),
            Err(e) => {
                STDIO_CLAIMED.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    fn flush_pending(&mut self) {
        if let Some(byte) = self.pending {
            if self.frontend.capacity() > 0 {
                self.pending = None;
                self.frontend.deliver(&[byte]);
            }
        }
    }
}

impl Drop for StdioChardev {
    fn drop(&mut self) {
        self.close();
    }
}

impl Chardev for StdioChardev {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdout.as_mut() {
            Some(stdout) => write_once(stdout, buf),
            None => Ok(buf.len()),
        }
    }

    fn set_frontend(&mut self, frontend: Box<dyn Frontend>) -> Result<()> {
        self.frontend.set(frontend);
        Ok(())
    }

    fn accept_input(&mut self) {
        self.flush_pending();
    }

    fn close(&mut self) {
        // the claim belongs to whoever still holds the descriptors
        if self.stdin.take().is_some() {
            STDIO_CLAIMED.store(false, Ordering::Release);
        }
        self.stdout = None;
        self.pending = None;
    }

    fn interest(&mut self) -> Interest {
        self.flush_pending();
        match &self.stdin {
            Some(stdin) if self.pending.is_none() && !self.eof => Interest::read(stdin.as_raw_fd()),
            _ => Interest::default(),
        }
    }

    fn on_readable(&mut self, _fd: RawFd) {
        let Some(stdin) = self.stdin.as_mut() else {
            return;
        };
        let mut byte = [0u8; 1];
        match stdin.read(&mut byte) {
            Ok(1) => {
                if self.frontend.capacity() > 0 {
                    self.frontend.deliver(&byte);
                } else if self.pending.is_none() {
                    self.pending = Some(byte[0]);
                }
            }
            Ok(_) => {
                tracing::debug!("stdin reached end of stream");
                self.eof = true;
                self.frontend.event(ChrEvent::Closed);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => tracing::debug!(error = %e, "stdin read failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test: the claim is process-wide and tests run in parallel.
    #[test]
    fn claim_is_exclusive_until_closed_or_dropped() {
        let first = StdioChardev::new().expect("first claim");
        assert!(matches!(StdioChardev::new(), Err(ChardevError::StdioBusy)));
        drop(first);

        let mut again = StdioChardev::new().expect("claim after drop");
        again.close();
        assert_eq!(again.interest(), Interest::default());
        assert_eq!(again.write(b"dropped").unwrap(), 7);

        let live = StdioChardev::new().expect("claim after close");
        // a stale handle must not free the live claim
        again.close();
        drop(again);
        assert!(matches!(StdioChardev::new(), Err(ChardevError::StdioBusy)));
        drop(live);
    }
}
