//! Minimal single-threaded reactor driving registered backends.
//!
//! Each turn asks every backend what it wants ([`Interest`]), waits on a
//! [`mio::Poll`] until a watched descriptor is readable or the earliest
//! timer is due, then dispatches. Backends are held weakly: once the owner
//! drops one it simply stops being polled, so no callback can reach a freed
//! backend.
//!
//! mio registrations are edge-triggered. Every watched descriptor is
//! re-registered at the top of each turn, which re-arms it, so a backend
//! that read less than was available is woken again on the next turn.
//!
//! [`Interest`]: crate::chardev::Interest

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};

use crate::chardev::Chardev;

/// Capacity for the [`mio::Events`] buffer.
const EVENTS_CAPACITY: usize = 64;

struct Source {
    dev: Weak<RefCell<dyn Chardev>>,
    token: Token,
    /// Descriptor currently registered with the poller.
    watched: Option<RawFd>,
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    sources: Vec<Source>,
    next_token: usize,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        Ok(EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            sources: Vec::new(),
            next_token: 0,
        })
    }

    pub fn register<C: Chardev + 'static>(&mut self, dev: &Rc<RefCell<C>>) {
        let dev: Rc<RefCell<dyn Chardev>> = dev.clone();
        self.sources.push(Source {
            dev: Rc::downgrade(&dev),
            token: Token(self.next_token),
            watched: None,
        });
        self.next_token += 1;
    }

    /// Number of backends still alive.
    pub fn len(&self) -> usize {
        self.sources.iter().filter(|s| s.dev.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one poll/dispatch cycle, waiting at most `max_wait`. Returns the
    /// number of callbacks dispatched.
    pub fn turn(&mut self, max_wait: Duration) -> io::Result<usize> {
        // a dropped backend closed its descriptor, which already removed it
        // from the poller; the number may belong to someone else by now
        self.sources.retain(|s| s.dev.strong_count() > 0);
        let live: Vec<Option<Rc<RefCell<dyn Chardev>>>> =
            self.sources.iter().map(|s| s.dev.upgrade()).collect();

        let mut wanted: Vec<Option<RawFd>> = Vec::with_capacity(live.len());
        let mut earliest: Option<Instant> = None;
        for dev in &live {
            let interest = dev.as_ref().map(|d| d.borrow_mut().interest()).unwrap_or_default();
            wanted.push(interest.readable);
            if let Some(deadline) = interest.deadline {
                earliest = Some(earliest.map_or(deadline, |e| e.min(deadline)));
            }
        }

        // Drop every stale registration before adding any, so a descriptor
        // number recycled between backends is never removed after being added.
        let registry = self.poll.registry();
        for (source, want) in self.sources.iter_mut().zip(&wanted) {
            if let Some(fd) = source.watched {
                if *want != Some(fd) {
                    let _ = registry.deregister(&mut SourceFd(&fd));
                    source.watched = None;
                }
            }
        }
        let mut unpollable: Vec<(usize, RawFd)> = Vec::new();
        for (i, (source, want)) in self.sources.iter_mut().zip(&wanted).enumerate() {
            let Some(fd) = *want else { continue };
            match watch(registry, fd, source.token, source.watched == Some(fd)) {
                Ok(()) => source.watched = Some(fd),
                // regular files and /dev/null cannot be polled but never block
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => unpollable.push((i, fd)),
                Err(e) => tracing::warn!(fd, error = %e, "cannot watch descriptor"),
            }
        }

        let mut wait = if unpollable.is_empty() {
            max_wait
        } else {
            Duration::ZERO
        };
        if let Some(deadline) = earliest {
            wait = wait.min(deadline.saturating_duration_since(Instant::now()));
        }
        match self.poll.poll(&mut self.events, Some(wait)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        let mut ready = unpollable;
        for event in self.events.iter() {
            if !(event.is_readable() || event.is_read_closed() || event.is_error()) {
                continue;
            }
            let owner = self.sources.iter().position(|s| s.token == event.token());
            if let Some(i) = owner {
                if let Some(fd) = self.sources[i].watched {
                    ready.push((i, fd));
                }
            }
        }

        let mut dispatched = 0;
        for (i, fd) in ready {
            if let Some(dev) = &live[i] {
                dev.borrow_mut().on_readable(fd);
                dispatched += 1;
            }
        }

        let now = Instant::now();
        for dev in live.iter().flatten() {
            let mut dev = dev.borrow_mut();
            // re-query: a read callback may have moved or cancelled the timer
            if let Some(deadline) = dev.interest().deadline {
                if deadline <= now {
                    dev.on_timer(now);
                    dispatched += 1;
                }
            }
        }

        Ok(dispatched)
    }

    /// Turn until `done` returns true or `timeout` elapses. Returns whether
    /// the condition was met.
    pub fn run_until(&mut self, timeout: Duration, mut done: impl FnMut() -> bool) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.turn((deadline - now).min(Duration::from_millis(50)))?;
        }
    }
}

/// Register `fd`, or re-arm it if it is already registered. The kernel
/// forgets a registration when its descriptor closes, and a reused number
/// may still be known, so each path falls back to the other.
fn watch(registry: &Registry, fd: RawFd, token: Token, known: bool) -> io::Result<()> {
    let mut source = SourceFd(&fd);
    if known {
        match registry.reregister(&mut source, token, Interest::READABLE) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                registry.register(&mut source, token, Interest::READABLE)
            }
            other => other,
        }
    } else {
        match registry.register(&mut source, token, Interest::READABLE) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                registry.reregister(&mut source, token, Interest::READABLE)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chardev::testing::Recorder;
    use crate::chardev::{Frontend, Interest};
    use crate::error::Result;
    use crate::fd::FdChardev;
    use std::io::Write;
    use std::os::fd::{OwnedFd, RawFd};
    use std::os::unix::net::UnixStream;

    /// Fires its timer once after a delay, then goes quiet.
    struct OneShot {
        deadline: Option<Instant>,
        fired: usize,
    }

    impl Chardev for OneShot {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn set_frontend(&mut self, _frontend: Box<dyn Frontend>) -> Result<()> {
            Ok(())
        }
        fn interest(&mut self) -> Interest {
            Interest {
                readable: None,
                deadline: self.deadline,
            }
        }
        fn on_readable(&mut self, _fd: RawFd) {}
        fn on_timer(&mut self, _now: Instant) {
            self.deadline = None;
            self.fired += 1;
        }
    }

    #[test]
    fn timer_fires_once_at_deadline() {
        let dev = Rc::new(RefCell::new(OneShot {
            deadline: Some(Instant::now() + Duration::from_millis(20)),
            fired: 0,
        }));
        let mut ev = EventLoop::new().unwrap();
        ev.register(&dev);

        let start = Instant::now();
        assert!(ev
            .run_until(Duration::from_secs(2), || dev.borrow().fired > 0)
            .unwrap());
        assert!(start.elapsed() >= Duration::from_millis(20));
        ev.turn(Duration::from_millis(30)).unwrap();
        assert_eq!(dev.borrow().fired, 1);
    }

    #[test]
    fn readable_descriptor_is_dispatched() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let dev = Rc::new(RefCell::new(
            FdChardev::new(Some(OwnedFd::from(ours)), None).unwrap(),
        ));
        let rec = Recorder::with_capacity(64);
        dev.borrow_mut().set_frontend(rec.boxed()).unwrap();

        let mut ev = EventLoop::new().unwrap();
        ev.register(&dev);
        peer.write_all(b"tick").unwrap();
        assert!(ev
            .run_until(Duration::from_secs(2), || rec.data() == b"tick")
            .unwrap());
    }

    /// Always takes exactly one byte at a time.
    struct Trickle(Rc<RefCell<Vec<u8>>>);

    impl Frontend for Trickle {
        fn can_receive(&mut self) -> usize {
            1
        }
        fn receive(&mut self, buf: &[u8]) {
            self.0.borrow_mut().extend_from_slice(buf);
        }
    }

    #[test]
    fn partially_read_descriptor_is_woken_again() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let dev = Rc::new(RefCell::new(
            FdChardev::new(Some(OwnedFd::from(ours)), None).unwrap(),
        ));
        let got = Rc::new(RefCell::new(Vec::new()));
        dev.borrow_mut().set_frontend(Box::new(Trickle(got.clone()))).unwrap();

        let mut ev = EventLoop::new().unwrap();
        ev.register(&dev);
        peer.write_all(b"abcdef").unwrap();
        assert!(ev
            .run_until(Duration::from_secs(2), || *got.borrow() == b"abcdef")
            .unwrap());
    }

    #[test]
    fn regular_file_input_is_read_without_polling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input");
        std::fs::write(&path, b"from a file").unwrap();
        let file = std::fs::File::open(&path).unwrap();
        let dev = Rc::new(RefCell::new(
            FdChardev::new(Some(OwnedFd::from(file)), None).unwrap(),
        ));
        let rec = Recorder::with_capacity(64);
        dev.borrow_mut().set_frontend(rec.boxed()).unwrap();

        let mut ev = EventLoop::new().unwrap();
        ev.register(&dev);
        assert!(ev
            .run_until(Duration::from_secs(2), || rec.data() == b"from a file")
            .unwrap());
        assert!(ev
            .run_until(Duration::from_secs(2), || rec.events().contains(&crate::ChrEvent::Closed))
            .unwrap());
    }

    #[test]
    fn dropped_backends_are_pruned() {
        let dev = Rc::new(RefCell::new(OneShot {
            deadline: None,
            fired: 0,
        }));
        let mut ev = EventLoop::new().unwrap();
        ev.register(&dev);
        assert_eq!(ev.len(), 1);
        drop(dev);
        assert!(ev.is_empty());
        assert_eq!(ev.turn(Duration::from_millis(1)).unwrap(), 0);
    }
}
