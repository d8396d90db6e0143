//! Host serial device (`/dev/ttyS*`, `/dev/ttyUSB*`, ...).
//!
//! Data flows through an [`FdChardev`] over the device node; the ioctl
//! side maps the emulated UART's line coding, break and modem lines onto
//! termios.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Instant;

use nix::sys::termios::{self, BaudRate, ControlFlags, SetArg};

use crate::chardev::{Chardev, Frontend, Interest};
use crate::error::{ChardevError, Result};
use crate::fd::FdChardev;
use crate::ioctl::{Ioctl, IoctlReply, ModemLines, Parity, SerialParams};

/// Standard rates, ascending. A request picks the first entry at or above it.
const SPEEDS: &[(u32, BaudRate)] = &[
    (50, BaudRate::B50),
    (75, BaudRate::B75),
    (110, BaudRate::B110),
    (134, BaudRate::B134),
    (150, BaudRate::B150),
    (200, BaudRate::B200),
    (300, BaudRate::B300),
    (600, BaudRate::B600),
    (1200, BaudRate::B1200),
    (1800, BaudRate::B1800),
    (2400, BaudRate::B2400),
    (4800, BaudRate::B4800),
    (9600, BaudRate::B9600),
    (19200, BaudRate::B19200),
    (38400, BaudRate::B38400),
    (57600, BaudRate::B57600),
    (115200, BaudRate::B115200),
];

pub(crate) fn baud_for(speed: u32) -> BaudRate {
    SPEEDS
        .iter()
        .find(|(rate, _)| speed <= *rate)
        .map_or(BaudRate::B115200, |(_, baud)| *baud)
}

mod modem {
    nix::ioctl_read_bad!(get_lines, libc::TIOCMGET, libc::c_int);
    nix::ioctl_write_ptr_bad!(set_lines, libc::TIOCMSET, libc::c_int);
}

pub struct SerialChardev {
    /// Control handle for termios and modem ioctls. `None` once closed.
    tty: Option<File>,
    data: FdChardev,
}

impl SerialChardev {
    pub fn open(path: &Path) -> Result<Self> {
        let tty = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| ChardevError::open(path, e))?;
        let mut dev = SerialChardev {
            data: FdChardev::new(
                Some(OwnedFd::from(tty.try_clone()?)),
                Some(OwnedFd::from(tty.try_clone()?)),
            )?,
            tty: Some(tty),
        };
        dev.apply(SerialParams::default())?;
        tracing::info!(path = %path.display(), "serial device opened");
        Ok(dev)
    }

    fn tty(&self) -> Result<&File> {
        self.tty
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial device closed").into())
    }

    fn apply(&mut self, params: SerialParams) -> Result<()> {
        let tty = self.tty()?;
        let mut tio = termios::tcgetattr(tty)?;
        termios::cfmakeraw(&mut tio);
        termios::cfsetspeed(&mut tio, baud_for(params.speed))?;

        let cflag = &mut tio.control_flags;
        cflag.remove(ControlFlags::CSIZE | ControlFlags::PARENB | ControlFlags::PARODD);
        cflag.remove(ControlFlags::CSTOPB);
        cflag.insert(match params.data_bits {
            5 => ControlFlags::CS5,
            6 => ControlFlags::CS6,
            7 => ControlFlags::CS7,
            _ => ControlFlags::CS8,
        });
        match params.parity {
            Parity::None => {}
            Parity::Even => cflag.insert(ControlFlags::PARENB),
            Parity::Odd => cflag.insert(ControlFlags::PARENB | ControlFlags::PARODD),
        }
        if params.stop_bits == 2 {
            cflag.insert(ControlFlags::CSTOPB);
        }
        cflag.insert(ControlFlags::CREAD | ControlFlags::CLOCAL);

        termios::tcsetattr(tty, SetArg::TCSANOW, &tio)?;
        tracing::debug!(?params, "serial line coding applied");
        Ok(())
    }

    fn modem_lines(&self) -> Result<ModemLines> {
        let fd = self.tty()?.as_raw_fd();
        let mut bits: libc::c_int = 0;
        // SAFETY: TIOCMGET writes one c_int.
        unsafe { modem::get_lines(fd, &mut bits) }?;
        Ok(ModemLines(bits as u32))
    }

    fn set_modem_lines(&self, lines: ModemLines) -> Result<()> {
        let fd = self.tty()?.as_raw_fd();
        let bits = lines.0 as libc::c_int;
        // SAFETY: TIOCMSET reads one c_int.
        unsafe { modem::set_lines(fd, &bits) }?;
        Ok(())
    }
}

impl Chardev for SerialChardev {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.write(buf)
    }

    fn set_frontend(&mut self, frontend: Box<dyn Frontend>) -> Result<()> {
        self.data.set_frontend(frontend)
    }

    fn ioctl(&mut self, request: Ioctl<'_>) -> Result<IoctlReply> {
        match request {
            Ioctl::SetSerialParams(params) => {
                self.apply(params)?;
                Ok(IoctlReply::Done)
            }
            Ioctl::SetBreak(true) => {
                termios::tcsendbreak(self.tty()?, 0)?;
                Ok(IoctlReply::Done)
            }
            Ioctl::SetBreak(false) => Ok(IoctlReply::Done),
            Ioctl::GetModemLines => Ok(IoctlReply::ModemLines(self.modem_lines()?)),
            Ioctl::SetModemLines(lines) => {
                self.set_modem_lines(lines)?;
                Ok(IoctlReply::Done)
            }
            _ => Err(ChardevError::Unsupported),
        }
    }

    fn accept_input(&mut self) {
        self.data.accept_input();
    }

    fn close(&mut self) {
        self.data.close();
        self.tty = None;
    }

    fn interest(&mut self) -> Interest {
        self.data.interest()
    }

    fn on_readable(&mut self, fd: RawFd) {
        self.data.on_readable(fd);
    }

    fn on_timer(&mut self, now: Instant) {
        self.data.on_timer(now);
    }
}
