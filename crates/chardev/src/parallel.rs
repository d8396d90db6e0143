//! Host parallel port via the Linux `ppdev` interface.
//!
//! There is no byte stream here: writes are swallowed and all traffic goes
//! through register-level ioctls. EPP block transfers switch the port's
//! IEEE 1284 mode on demand and remember it to avoid redundant switches.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::chardev::{Chardev, Frontend, FrontendSlot};
use crate::error::{ChardevError, Result};
use crate::ioctl::{EppCycle, Ioctl, IoctlReply};

const IEEE1284_MODE_COMPAT: libc::c_int = 0;
const IEEE1284_MODE_EPP: libc::c_int = 1 << 6;
const IEEE1284_ADDR: libc::c_int = 1 << 13;

mod ppdev {
    nix::ioctl_write_ptr!(set_mode, b'p', 0x80, libc::c_int);
    nix::ioctl_read!(read_status, b'p', 0x81, u8);
    nix::ioctl_read!(read_control, b'p', 0x83, u8);
    nix::ioctl_write_ptr!(write_control, b'p', 0x84, u8);
    nix::ioctl_read!(read_data, b'p', 0x85, u8);
    nix::ioctl_write_ptr!(write_data, b'p', 0x86, u8);
    nix::ioctl_none!(claim, b'p', 0x8b);
    nix::ioctl_none!(release, b'p', 0x8c);
    nix::ioctl_write_ptr!(data_dir, b'p', 0x90, libc::c_int);
}

pub struct ParallelChardev {
    /// `None` once closed.
    port: Option<File>,
    mode: libc::c_int,
    frontend: FrontendSlot,
}

impl ParallelChardev {
    /// Open and claim a `/dev/parportN` node.
    pub fn open(path: &Path) -> Result<Self> {
        let port = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ChardevError::open(path, e))?;
        // SAFETY: PPCLAIM takes no argument; the descriptor is open.
        unsafe { ppdev::claim(port.as_raw_fd()) }.map_err(|e| ChardevError::open(path, e.into()))?;
        tracing::info!(path = %path.display(), "parallel port claimed");
        Ok(Self::claimed(port))
    }

    fn claimed(port: File) -> Self {
        ParallelChardev {
            port: Some(port),
            mode: IEEE1284_MODE_COMPAT,
            frontend: FrontendSlot::new(),
        }
    }

    fn port(&mut self) -> Result<&mut File> {
        self.port
            .as_mut()
            .ok_or_else(port_closed)
    }

    fn port_fd(&self) -> Result<libc::c_int> {
        match &self.port {
            Some(port) => Ok(port.as_raw_fd()),
            None => Err(port_closed()),
        }
    }

    fn switch_mode(&mut self, fd: libc::c_int, mode: libc::c_int) -> bool {
        if mode == self.mode {
            return true;
        }
        // SAFETY: PPSETMODE reads one c_int from the pointer.
        match unsafe { ppdev::set_mode(fd, &mode) } {
            Ok(_) => {
                self.mode = mode;
                true
            }
            Err(e) => {
                tracing::debug!(mode, error = %e, "PPSETMODE rejected");
                false
            }
        }
    }

    fn epp_mode(cycle: EppCycle) -> libc::c_int {
        match cycle {
            EppCycle::Data => IEEE1284_MODE_EPP,
            EppCycle::Address => IEEE1284_MODE_EPP | IEEE1284_ADDR,
        }
    }

    fn read_register(
        &self,
        op: unsafe fn(libc::c_int, *mut u8) -> nix::Result<libc::c_int>,
    ) -> Result<IoctlReply> {
        let fd = self.port_fd()?;
        let mut b = 0u8;
        // SAFETY: the ppdev read ioctls write exactly one byte.
        unsafe { op(fd, &mut b) }.map_err(|_| ChardevError::Unsupported)?;
        Ok(IoctlReply::Byte(b))
    }

    fn write_register(
        &self,
        op: unsafe fn(libc::c_int, *const u8) -> nix::Result<libc::c_int>,
        value: u8,
    ) -> Result<IoctlReply> {
        let fd = self.port_fd()?;
        // SAFETY: the ppdev write ioctls read exactly one byte.
        unsafe { op(fd, &value) }.map_err(|_| ChardevError::Unsupported)?;
        Ok(IoctlReply::Done)
    }
}

fn port_closed() -> ChardevError {
    io::Error::new(io::ErrorKind::NotConnected, "parallel port closed").into()
}

fn short_transfer(expected: usize, got: usize) -> ChardevError {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("EPP transfer moved {got} of {expected} bytes"),
    )
    .into()
}

impl Chardev for ParallelChardev {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn set_frontend(&mut self, frontend: Box<dyn Frontend>) -> Result<()> {
        self.frontend.set(frontend);
        Ok(())
    }

    fn ioctl(&mut self, request: Ioctl<'_>) -> Result<IoctlReply> {
        match request {
            Ioctl::PpReadData => self.read_register(ppdev::read_data),
            Ioctl::PpWriteData(b) => self.write_register(ppdev::write_data, b),
            Ioctl::PpReadControl => self.read_register(ppdev::read_control),
            Ioctl::PpWriteControl(b) => self.write_register(ppdev::write_control, b),
            Ioctl::PpReadStatus => self.read_register(ppdev::read_status),
            Ioctl::PpDataDir(reverse) => {
                let fd = self.port_fd()?;
                let dir = libc::c_int::from(reverse);
                // SAFETY: PPDATADIR reads one c_int.
                unsafe { ppdev::data_dir(fd, &dir) }
                    .map_err(|_| ChardevError::Unsupported)?;
                Ok(IoctlReply::Done)
            }
            Ioctl::PpEppRead { cycle, buf } => {
                let fd = self.port_fd()?;
                if self.switch_mode(fd, Self::epp_mode(cycle)) {
                    let n = self.port()?.read(buf)?;
                    if n != buf.len() {
                        return Err(short_transfer(buf.len(), n));
                    }
                }
                Ok(IoctlReply::Done)
            }
            Ioctl::PpEppWrite { cycle, buf } => {
                let fd = self.port_fd()?;
                if self.switch_mode(fd, Self::epp_mode(cycle)) {
                    let n = self.port()?.write(buf)?;
                    if n != buf.len() {
                        return Err(short_transfer(buf.len(), n));
                    }
                }
                Ok(IoctlReply::Done)
            }
            _ => Err(ChardevError::Unsupported),
        }
    }

    /// Restore compat mode and give up the claim before the descriptor goes.
    fn close(&mut self) {
        let Some(port) = self.port.take() else {
            return;
        };
        let fd = port.as_raw_fd();
        let compat = IEEE1284_MODE_COMPAT;
        // SAFETY: restoring compat mode and releasing our own claim.
        unsafe {
            let _ = ppdev::set_mode(fd, &compat);
            let _ = ppdev::release(fd);
        }
        self.mode = IEEE1284_MODE_COMPAT;
    }
}

impl Drop for ParallelChardev {
    fn drop(&mut self) {
        self.close();
    }
}
