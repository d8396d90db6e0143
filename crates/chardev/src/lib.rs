//! Character-stream backends and an escape-driven stream multiplexer.
//!
//! Every transport (pseudo-terminal, TCP/Telnet or Unix socket, pipes,
//! raw files, UDP, stdio, host serial and parallel ports) implements the
//! same [`Chardev`] contract: non-blocking writes, a registered
//! [`Frontend`] that is never handed more bytes than it just said it
//! could take, out-of-band [`ChrEvent`]s, and a typed [`Ioctl`] side
//! channel. [`Mux`] fans one backend out to several consumers.
//!
//! Nothing here blocks or spawns threads. A single-threaded
//! [`EventLoop`] asks each backend what it is waiting for and dispatches
//! readiness and timers.
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! let spec: chardev::ChardevSpec = "tcp::4555,server,nowait,telnet".parse()?;
//! let dev = Rc::new(RefCell::new(chardev::open(&spec)?));
//! let mut ev = chardev::EventLoop::new()?;
//! ev.register(&dev);
//! ev.turn(Duration::from_millis(100))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod chardev;
pub mod config;
pub mod error;
pub mod fd;
pub mod ioctl;
pub mod mux;
pub mod null;
pub mod parallel;
pub mod pty;
pub mod reactor;
pub mod serial;
pub mod socket;
pub mod stdio;
pub mod telnet;
pub mod udp;

pub use crate::chardev::{ChrEvent, Chardev, Frontend, FrontendSlot, Interest};
pub use crate::config::{open, ChardevSpec, HostConfig};
pub use crate::error::{ChardevError, Result};
pub use crate::ioctl::{Ioctl, IoctlReply};
pub use crate::mux::{Mux, MuxHooks, MuxOptions};
pub use crate::reactor::EventLoop;
