//! The backend contract shared by every transport, and the consumer side
//! of flow control.
//!
//! A backend never pushes more bytes upward than the registered
//! [`Frontend`] said it could take *at that moment*. [`FrontendSlot`]
//! enforces that: it re-queries capacity before every hand-off and parks
//! whatever could not be delivered until the consumer drains.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::time::Instant;

use crate::error::{ChardevError, Result};
use crate::ioctl::{Ioctl, IoctlReply};

/// Out-of-band notifications raised toward a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChrEvent {
    /// A serial break (Telnet `IAC BREAK`, or the mux `b` command).
    Break,
    /// The transport (re)connected; consumers should reset line state.
    Reset,
    /// This multiplexer slot just received input focus.
    FocusGained,
    /// This multiplexer slot just lost input focus.
    FocusLost,
    /// The peer went away (end of stream on a pipe or socket).
    Closed,
}

/// A registered consumer: a device model or console front end.
pub trait Frontend {
    /// How many bytes can be accepted right now. Never cached by backends.
    fn can_receive(&mut self) -> usize;

    /// Called with at most the most recently reported capacity.
    fn receive(&mut self, buf: &[u8]);

    fn event(&mut self, _event: ChrEvent) {}
}

/// What a backend wants from the reactor on the next turn.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    /// Descriptor to watch for readability. `None` means "not now",
    /// typically because the consumer has no room.
    pub readable: Option<RawFd>,
    /// Software timer deadline, if one is armed.
    pub deadline: Option<Instant>,
}

impl Interest {
    pub fn read(fd: RawFd) -> Self {
        Interest {
            readable: Some(fd),
            deadline: None,
        }
    }
}

/// A byte-stream endpoint.
///
/// The first half of the trait is what device models call; the second
/// half (`interest`, `on_readable`, `on_timer`) is what the reactor calls.
/// Callbacks must not re-enter the same backend synchronously from inside
/// [`Frontend::receive`]; queue the reply and write it after dispatch.
pub trait Chardev {
    /// Attempt one non-blocking write. Returns the bytes accepted.
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;

    /// Register (or replace) the consumer.
    fn set_frontend(&mut self, frontend: Box<dyn Frontend>) -> Result<()>;

    /// Transport-specific side channel.
    fn ioctl(&mut self, _request: Ioctl<'_>) -> Result<IoctlReply> {
        Err(ChardevError::Unsupported)
    }

    /// The consumer may have room again; push anything buffered upward.
    fn accept_input(&mut self) {}

    /// Release descriptors and cancel timers. Idempotent.
    fn close(&mut self) {}

    fn interest(&mut self) -> Interest {
        Interest::default()
    }

    fn on_readable(&mut self, _fd: RawFd) {}

    fn on_timer(&mut self, _now: Instant) {}
}

impl<C: Chardev + ?Sized> Chardev for Box<C> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (**self).write(buf)
    }

    fn set_frontend(&mut self, frontend: Box<dyn Frontend>) -> Result<()> {
        (**self).set_frontend(frontend)
    }

    fn ioctl(&mut self, request: Ioctl<'_>) -> Result<IoctlReply> {
        (**self).ioctl(request)
    }

    fn accept_input(&mut self) {
        (**self).accept_input()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn interest(&mut self) -> Interest {
        (**self).interest()
    }

    fn on_readable(&mut self, fd: RawFd) {
        (**self).on_readable(fd)
    }

    fn on_timer(&mut self, now: Instant) {
        (**self).on_timer(now)
    }
}

/// Holder for one backend's consumer registration plus the bytes it
/// could not take yet.
#[derive(Default)]
pub struct FrontendSlot {
    frontend: Option<Box<dyn Frontend>>,
    backlog: VecDeque<u8>,
}

impl FrontendSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, frontend: Box<dyn Frontend>) {
        self.frontend = Some(frontend);
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Raw consumer capacity; zero with no consumer.
    pub fn capacity(&mut self) -> usize {
        self.frontend.as_mut().map_or(0, |fe| fe.can_receive())
    }

    /// How many fresh bytes the backend may read now. Drains the backlog
    /// first and reports zero while any of it remains.
    pub fn read_capacity(&mut self) -> usize {
        self.flush();
        if !self.backlog.is_empty() {
            return 0;
        }
        self.capacity()
    }

    /// Hand bytes upward in the largest chunks capacity allows.
    pub fn deliver(&mut self, buf: &[u8]) {
        self.backlog.extend(buf);
        self.drain(usize::MAX);
    }

    /// Hand bytes upward one at a time, re-checking capacity per byte.
    pub fn deliver_each(&mut self, buf: &[u8]) {
        self.backlog.extend(buf);
        self.drain(1);
    }

    /// Push parked bytes upward. Returns how many went out.
    pub fn flush(&mut self) -> usize {
        self.drain(usize::MAX)
    }

    pub fn event(&mut self, event: ChrEvent) {
        if let Some(fe) = self.frontend.as_mut() {
            fe.event(event);
        }
    }

    fn drain(&mut self, max_chunk: usize) -> usize {
        let Some(fe) = self.frontend.as_mut() else {
            return 0;
        };
        let mut sent = 0;
        while !self.backlog.is_empty() {
            let room = fe.can_receive();
            if room == 0 {
                break;
            }
            let n = room.min(max_chunk).min(self.backlog.len());
            let chunk = &self.backlog.make_contiguous()[..n];
            fe.receive(chunk);
            self.backlog.drain(..n);
            sent += n;
        }
        sent
    }
}
