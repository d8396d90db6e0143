//! Escape-driven multiplexer: one backend shared by several consumers.
//!
//! Input from the wrapped backend goes to the focused consumer, except
//! that the escape character (Ctrl-A by default) introduces a one-letter
//! local command. Each consumer slot owns a small ring buffer so a
//! consumer that is momentarily full does not stall the wrapped backend
//! or lose bytes unless it falls a whole buffer behind.
//!
//! [`Mux`] is a cheap handle; every clone is a [`Chardev`] and every
//! `set_frontend` call on any clone claims the next slot.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::chardev::{ChrEvent, Chardev, Frontend, Interest};
use crate::error::{ChardevError, Result};
use crate::ioctl::{Ioctl, IoctlReply};

pub const DEFAULT_ESCAPE_CHAR: u8 = 0x01;
pub const DEFAULT_MAX_SLOTS: usize = 4;
pub const DEFAULT_BUFFER_SIZE: usize = 32;

/// Output produced while the wrapped backend is busy is parked here, up
/// to this many bytes.
const MAX_PENDING: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxOptions {
    pub escape_char: u8,
    pub max_slots: usize,
    /// Per-slot ring size. Must be a power of two.
    pub buffer_size: usize,
}

impl Default for MuxOptions {
    fn default() -> Self {
        MuxOptions {
            escape_char: DEFAULT_ESCAPE_CHAR,
            max_slots: DEFAULT_MAX_SLOTS,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl MuxOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_slots == 0 {
            return Err(ChardevError::InvalidOptions(
                "max_slots must be at least 1".to_string(),
            ));
        }
        if !self.buffer_size.is_power_of_two() {
            return Err(ChardevError::InvalidOptions(format!(
                "buffer_size {} is not a power of two",
                self.buffer_size
            )));
        }
        Ok(())
    }
}

/// Process-level actions behind the `x` and `s` commands.
pub trait MuxHooks {
    fn terminate(&mut self) {
        std::process::exit(0);
    }

    fn commit_storage(&mut self) {
        tracing::info!("no block storage attached, nothing to commit");
    }
}

/// Default hooks: `x` exits the process, `s` only logs.
pub struct ProcessHooks;

impl MuxHooks for ProcessHooks {}

const HELP: &[&str] = &[
    "% h    print this help\n\r",
    "% x    terminate\n\r",
    "% s    commit storage to backing files\n\r",
    "% t    toggle console timestamps\n\r",
    "% b    send break\n\r",
    "% c    switch to the next consumer\n\r",
    "% %  sends %\n\r",
];

/// Command table as printed by `h`, with `%` standing for the escape key.
pub fn help_text(escape: u8) -> String {
    let (key, mut text) = if (1..=25).contains(&escape) {
        (format!("C-{}", (b'a' + escape - 1) as char), String::from("\n\r"))
    } else {
        (
            String::from("Escape-Char"),
            format!("\n\rEscape-Char set to Ascii: 0x{escape:02x}\n\r\n\r"),
        )
    };
    for line in HELP {
        text.push_str(&line.replace('%', &key));
    }
    text
}

/// `[HH:MM:SS.mmm] ` for the time since timestamps were switched on.
pub fn timestamp_prefix(elapsed: Duration) -> String {
    let ms = elapsed.as_millis();
    let secs = ms / 1000;
    format!(
        "[{:02}:{:02}:{:02}.{:03}] ",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        ms % 1000
    )
}

// ── Per-slot ring ──────────────────────────────────────────────────────

/// Fixed ring with free-running cursors masked to the (power of two) size.
struct Ring {
    buf: Box<[u8]>,
    prod: usize,
    cons: usize,
}

impl Ring {
    fn new(size: usize) -> Self {
        Ring {
            buf: vec![0u8; size].into_boxed_slice(),
            prod: 0,
            cons: 0,
        }
    }

    fn mask(&self) -> usize {
        self.buf.len() - 1
    }

    fn len(&self) -> usize {
        self.prod.wrapping_sub(self.cons)
    }

    fn is_empty(&self) -> bool {
        self.prod == self.cons
    }

    fn is_full(&self) -> bool {
        self.len() >= self.buf.len()
    }

    fn free(&self) -> usize {
        self.buf.len() - self.len()
    }

    /// Append, overwriting the oldest byte when full. Returns whether a
    /// byte was lost.
    fn push(&mut self, byte: u8) -> bool {
        let overwrote = self.is_full();
        if overwrote {
            self.cons = self.cons.wrapping_add(1);
        }
        let i = self.prod & self.mask();
        self.buf[i] = byte;
        self.prod = self.prod.wrapping_add(1);
        overwrote
    }

    fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let byte = self.buf[self.cons & self.mask()];
        self.cons = self.cons.wrapping_add(1);
        Some(byte)
    }
}

struct Slot {
    frontend: Box<dyn Frontend>,
    ring: Ring,
}

impl Slot {
    fn drain(&mut self) {
        while !self.ring.is_empty() && self.frontend.can_receive() > 0 {
            if let Some(byte) = self.ring.pop() {
                self.frontend.receive(&[byte]);
            }
        }
    }

    fn deliver(&mut self, byte: u8) {
        self.drain();
        if self.ring.is_empty() && self.frontend.can_receive() > 0 {
            self.frontend.receive(&[byte]);
        } else if self.ring.push(byte) {
            tracing::debug!("mux slot buffer full, oldest byte dropped");
        }
    }
}

// ── Shared state ───────────────────────────────────────────────────────

struct MuxInputState {
    slots: Vec<Slot>,
    escape_pending: bool,
    exit_requested: bool,
    hooks: Box<dyn MuxHooks>,
}

impl MuxInputState {
    /// Focus is updated before either event is raised, so consumers that
    /// ask the handle from inside `event` see the new slot.
    fn set_focus(&mut self, shared: &MuxShared, next: usize) {
        let old = shared.focus.replace(Some(next));
        if let Some(old) = old {
            self.slots[old].frontend.event(ChrEvent::FocusLost);
        }
        self.slots[next].frontend.event(ChrEvent::FocusGained);
        tracing::info!(focus = next, "mux focus switched");
    }

    /// Run one inbound byte through the command interpreter. Returns the
    /// byte if it is data for the focused slot.
    fn interpret(&mut self, shared: &MuxShared, byte: u8) -> Option<u8> {
        let escape = shared.opts.escape_char;
        if !self.escape_pending {
            if byte == escape {
                self.escape_pending = true;
                return None;
            }
            return Some(byte);
        }
        self.escape_pending = false;
        match byte {
            b if b == escape => return Some(b),
            b'h' | b'?' => {
                tracing::debug!("mux command: help");
                shared.send(help_text(escape).as_bytes());
            }
            b'x' => {
                tracing::info!("mux command: terminate");
                shared.send(b"Terminated\n\r");
                self.exit_requested = true;
            }
            b's' => {
                tracing::info!("mux command: commit storage");
                self.hooks.commit_storage();
            }
            b'b' => {
                tracing::debug!("mux command: break");
                if let Some(focus) = shared.focus.get() {
                    self.slots[focus].frontend.event(ChrEvent::Break);
                }
            }
            b'c' => {
                if let Some(focus) = shared.focus.get() {
                    self.set_focus(shared, (focus + 1) % self.slots.len());
                }
            }
            b't' => {
                let on = shared.toggle_timestamps();
                tracing::debug!(on, "mux command: timestamps");
            }
            other => return Some(other),
        }
        None
    }
}

struct MuxOutput {
    started: Instant,
    linestart: bool,
    pending: Vec<u8>,
}

impl MuxOutput {
    fn queue(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(MAX_PENDING.saturating_sub(self.pending.len()));
        self.pending.extend_from_slice(&bytes[..n]);
        if n < bytes.len() {
            tracing::debug!(refused = bytes.len() - n, "mux output queue full");
        }
        n
    }

    /// Prefix every line start in `buf`. Also returns, per input byte, the
    /// stamped length up to and including that byte. Line state is left
    /// alone; the caller commits it for however much was accepted.
    fn stamp_lines(&self, buf: &[u8]) -> (Vec<u8>, Vec<usize>) {
        let prefix = timestamp_prefix(self.started.elapsed());
        let mut linestart = self.linestart;
        let mut stamped = Vec::with_capacity(buf.len() + prefix.len());
        let mut ends = Vec::with_capacity(buf.len());
        for &byte in buf {
            if linestart {
                stamped.extend_from_slice(prefix.as_bytes());
            }
            stamped.push(byte);
            linestart = byte == b'\n';
            ends.push(stamped.len());
        }
        (stamped, ends)
    }
}

struct MuxShared {
    opts: MuxOptions,
    // Plain cells so the handle's accessors work from inside callbacks.
    focus: Cell<Option<usize>>,
    slot_count: Cell<usize>,
    timestamps: Cell<bool>,
    inner: RefCell<Box<dyn Chardev>>,
    input: RefCell<MuxInputState>,
    output: RefCell<MuxOutput>,
}

fn drain_pending(pending: &mut Vec<u8>, inner: &mut dyn Chardev) -> io::Result<()> {
    while !pending.is_empty() {
        let n = inner.write(pending)?;
        if n == 0 {
            break;
        }
        pending.drain(..n);
    }
    Ok(())
}

fn busy() -> ChardevError {
    io::Error::new(io::ErrorKind::WouldBlock, "multiplexed backend is dispatching").into()
}

impl MuxShared {
    /// Bytes from the mux itself (help, notices). Never timestamped; queued
    /// when the wrapped backend is mid-dispatch.
    fn send(&self, bytes: &[u8]) {
        let Ok(mut out) = self.output.try_borrow_mut() else {
            return;
        };
        if let Err(e) = self.emit(&mut out, bytes, None) {
            tracing::debug!(error = %e, "mux notice not written");
        }
    }

    /// Write what the wrapped backend takes now and queue the rest, as far
    /// as the queue allows. With `bounds` (ascending offsets into `bytes`)
    /// the count taken always lands on one of them; without, on any byte.
    /// Returns how many bytes of `bytes` were written or queued.
    fn emit(&self, out: &mut MuxOutput, bytes: &[u8], bounds: Option<&[usize]>) -> io::Result<usize> {
        let mut written = 0;
        if let Ok(mut inner) = self.inner.try_borrow_mut() {
            drain_pending(&mut out.pending, &mut **inner)?;
            if out.pending.is_empty() {
                written = inner.write(bytes)?;
            }
        }
        let limit = written + MAX_PENDING.saturating_sub(out.pending.len());
        let end = match bounds {
            None => bytes.len().min(limit),
            Some(bounds) => match bounds.iter().copied().take_while(|&b| b <= limit).last() {
                Some(b) if b >= written => b,
                // the backend already took part of a unit: finish it over the cap
                _ => bounds.iter().copied().find(|&b| b >= written).unwrap_or(bytes.len()),
            },
        };
        out.pending.extend_from_slice(&bytes[written..end]);
        if end < bytes.len() {
            tracing::debug!(refused = bytes.len() - end, "mux output queue full");
        }
        Ok(end)
    }

    fn flush_pending(&self) {
        let Ok(mut out) = self.output.try_borrow_mut() else {
            return;
        };
        if out.pending.is_empty() {
            return;
        }
        let Ok(mut inner) = self.inner.try_borrow_mut() else {
            return;
        };
        if let Err(e) = drain_pending(&mut out.pending, &mut **inner) {
            tracing::debug!(error = %e, "mux queued output not written");
            out.pending.clear();
        }
    }

    fn toggle_timestamps(&self) -> bool {
        let on = !self.timestamps.get();
        self.timestamps.set(on);
        if let Ok(mut out) = self.output.try_borrow_mut() {
            out.started = Instant::now();
            // the command was typed mid-line
            out.linestart = false;
        }
        on
    }

    /// Housekeeping once control returns from the wrapped backend.
    fn after_dispatch(&self) {
        self.flush_pending();
        if let Ok(mut input) = self.input.try_borrow_mut() {
            if std::mem::take(&mut input.exit_requested) {
                input.hooks.terminate();
            }
        }
    }
}

/// The consumer the mux registers with the wrapped backend.
struct MuxInput(Weak<MuxShared>);

impl Frontend for MuxInput {
    fn can_receive(&mut self) -> usize {
        let Some(shared) = self.0.upgrade() else {
            return 0;
        };
        let Some(focus) = shared.focus.get() else {
            return 0;
        };
        let Ok(mut input) = shared.input.try_borrow_mut() else {
            return 0;
        };
        let slot = &mut input.slots[focus];
        if slot.ring.is_full() {
            slot.frontend.can_receive()
        } else {
            slot.ring.free()
        }
    }

    fn receive(&mut self, buf: &[u8]) {
        let Some(shared) = self.0.upgrade() else {
            return;
        };
        let Ok(mut input) = shared.input.try_borrow_mut() else {
            tracing::warn!(len = buf.len(), "mux input re-entered, bytes dropped");
            return;
        };
        for &byte in buf {
            if let Some(data) = input.interpret(&shared, byte) {
                if let Some(focus) = shared.focus.get() {
                    input.slots[focus].deliver(data);
                }
            }
        }
    }

    fn event(&mut self, event: ChrEvent) {
        let Some(shared) = self.0.upgrade() else {
            return;
        };
        let Ok(mut input) = shared.input.try_borrow_mut() else {
            tracing::debug!(?event, "mux busy, event dropped");
            return;
        };
        for slot in &mut input.slots {
            slot.frontend.event(event);
        }
    }
}

// ── Handle ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Mux(Rc<MuxShared>);

impl Mux {
    pub fn new(inner: Box<dyn Chardev>, opts: MuxOptions) -> Result<Self> {
        Self::with_hooks(inner, opts, Box::new(ProcessHooks))
    }

    pub fn with_hooks(
        inner: Box<dyn Chardev>,
        opts: MuxOptions,
        hooks: Box<dyn MuxHooks>,
    ) -> Result<Self> {
        opts.validate()?;
        Ok(Mux(Rc::new(MuxShared {
            opts,
            focus: Cell::new(None),
            slot_count: Cell::new(0),
            timestamps: Cell::new(false),
            inner: RefCell::new(inner),
            input: RefCell::new(MuxInputState {
                slots: Vec::with_capacity(opts.max_slots),
                escape_pending: false,
                exit_requested: false,
                hooks,
            }),
            output: RefCell::new(MuxOutput {
                started: Instant::now(),
                linestart: false,
                pending: Vec::new(),
            }),
        })))
    }

    pub fn options(&self) -> MuxOptions {
        self.0.opts
    }

    pub fn consumers(&self) -> usize {
        self.0.slot_count.get()
    }

    pub fn focus(&self) -> Option<usize> {
        self.0.focus.get()
    }

    pub fn timestamps(&self) -> bool {
        self.0.timestamps.get()
    }

    /// Move input focus to slot `index`, raising the lost/gained pair.
    pub fn set_focus(&self, index: usize) -> Result<()> {
        let mut input = self.0.input.try_borrow_mut().map_err(|_| busy())?;
        if index >= input.slots.len() {
            return Err(ChardevError::InvalidOptions(format!(
                "no consumer in slot {index}"
            )));
        }
        input.set_focus(&self.0, index);
        Ok(())
    }
}

impl Chardev for Mux {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let shared = &*self.0;
        let Ok(mut out) = shared.output.try_borrow_mut() else {
            return Ok(0);
        };
        if shared.timestamps.get() {
            let (stamped, ends) = out.stamp_lines(buf);
            let taken = shared.emit(&mut out, &stamped, Some(&ends))?;
            let accepted = ends.partition_point(|&end| end <= taken);
            if accepted > 0 {
                out.linestart = buf[accepted - 1] == b'\n';
            }
            return Ok(accepted);
        }
        let Ok(mut inner) = shared.inner.try_borrow_mut() else {
            // answering from inside a delivery callback
            return Ok(out.queue(buf));
        };
        drain_pending(&mut out.pending, &mut **inner)?;
        if !out.pending.is_empty() {
            return Ok(0);
        }
        inner.write(buf)
    }

    fn set_frontend(&mut self, frontend: Box<dyn Frontend>) -> Result<()> {
        let opts = self.0.opts;
        let slot = {
            let mut input = self.0.input.try_borrow_mut().map_err(|_| busy())?;
            if input.slots.len() >= opts.max_slots {
                return Err(ChardevError::TooManyConsumers {
                    max: opts.max_slots,
                });
            }
            input.slots.push(Slot {
                frontend,
                ring: Ring::new(opts.buffer_size),
            });
            self.0.slot_count.set(input.slots.len());
            input.slots.len() - 1
        };
        tracing::debug!(slot, "mux consumer registered");
        if slot == 0 {
            let hook = MuxInput(Rc::downgrade(&self.0));
            self.0
                .inner
                .try_borrow_mut()
                .map_err(|_| busy())?
                .set_frontend(Box::new(hook))?;
            self.0
                .input
                .try_borrow_mut()
                .map_err(|_| busy())?
                .set_focus(&self.0, 0);
        }
        Ok(())
    }

    fn ioctl(&mut self, request: Ioctl<'_>) -> Result<IoctlReply> {
        self.0.inner.try_borrow_mut().map_err(|_| busy())?.ioctl(request)
    }

    fn accept_input(&mut self) {
        if let (Some(focus), Ok(mut input)) = (self.0.focus.get(), self.0.input.try_borrow_mut()) {
            input.slots[focus].drain();
        }
        if let Ok(mut inner) = self.0.inner.try_borrow_mut() {
            inner.accept_input();
        }
        self.0.after_dispatch();
    }

    fn close(&mut self) {
        if let Ok(mut inner) = self.0.inner.try_borrow_mut() {
            inner.close();
        }
    }

    fn interest(&mut self) -> Interest {
        self.0.flush_pending();
        match self.0.inner.try_borrow_mut() {
            Ok(mut inner) => inner.interest(),
            Err(_) => Interest::default(),
        }
    }

    fn on_readable(&mut self, fd: RawFd) {
        if let Ok(mut inner) = self.0.inner.try_borrow_mut() {
            inner.on_readable(fd);
        }
        self.0.after_dispatch();
    }

    fn on_timer(&mut self, now: Instant) {
        if let Ok(mut inner) = self.0.inner.try_borrow_mut() {
            inner.on_timer(now);
        }
        self.0.after_dispatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chardev::testing::Recorder;
    use crate::chardev::FrontendSlot;

    const ESC: u8 = DEFAULT_ESCAPE_CHAR;

    /// Scripted wrapped backend: inbound bytes are queued by the test and
    /// delivered on the next `on_readable`.
    #[derive(Default)]
    struct Wire {
        written: Vec<u8>,
        incoming: Vec<u8>,
        slot: FrontendSlot,
        closed: bool,
    }

    #[derive(Clone, Default)]
    struct FakeInner(Rc<RefCell<Wire>>);

    impl FakeInner {
        fn written(&self) -> Vec<u8> {
            self.0.borrow().written.clone()
        }

        fn written_text(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow().written).into_owned()
        }

        fn raise(&self, event: ChrEvent) {
            self.0.borrow_mut().slot.event(event);
        }
    }

    impl Chardev for FakeInner {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn set_frontend(&mut self, frontend: Box<dyn Frontend>) -> Result<()> {
            self.0.borrow_mut().slot.set(frontend);
            Ok(())
        }

        fn accept_input(&mut self) {
            self.0.borrow_mut().slot.flush();
        }

        fn close(&mut self) {
            self.0.borrow_mut().closed = true;
        }

        fn on_readable(&mut self, _fd: RawFd) {
            let mut wire = self.0.borrow_mut();
            let data = std::mem::take(&mut wire.incoming);
            wire.slot.deliver(&data);
        }
    }

    #[derive(Clone, Default)]
    struct HookLog(Rc<RefCell<Vec<&'static str>>>);

    impl MuxHooks for HookLog {
        fn terminate(&mut self) {
            self.0.borrow_mut().push("terminate");
        }

        fn commit_storage(&mut self) {
            self.0.borrow_mut().push("commit");
        }
    }

    struct Harness {
        mux: Mux,
        wire: FakeInner,
        hooks: HookLog,
    }

    impl Harness {
        fn new(opts: MuxOptions) -> Self {
            let wire = FakeInner::default();
            let hooks = HookLog::default();
            let mux = Mux::with_hooks(Box::new(wire.clone()), opts, Box::new(hooks.clone())).unwrap();
            Harness { mux, wire, hooks }
        }

        fn with_consumers(n: usize) -> (Self, Vec<Recorder>) {
            let mut h = Self::new(MuxOptions::default());
            let recs: Vec<Recorder> = (0..n).map(|_| Recorder::with_capacity(256)).collect();
            for rec in &recs {
                h.mux.set_frontend(rec.boxed()).unwrap();
            }
            (h, recs)
        }

        fn type_in(&mut self, bytes: &[u8]) {
            self.wire.0.borrow_mut().incoming.extend_from_slice(bytes);
            self.mux.on_readable(0);
        }
    }

    #[test]
    fn first_consumer_takes_focus_and_later_ones_do_not() {
        let (h, recs) = Harness::with_consumers(2);
        assert_eq!(h.mux.focus(), Some(0));
        assert_eq!(recs[0].events(), vec![ChrEvent::FocusGained]);
        assert!(recs[1].events().is_empty());
    }

    #[test]
    fn data_goes_to_the_focused_consumer_only() {
        let (mut h, recs) = Harness::with_consumers(2);
        h.type_in(b"ls\r");
        assert_eq!(recs[0].data(), b"ls\r");
        assert!(recs[1].data().is_empty());
    }

    #[test]
    fn focus_switch_wraps_and_raises_one_event_pair() {
        let (mut h, recs) = Harness::with_consumers(2);
        h.type_in(&[ESC, b'c']);
        assert_eq!(h.mux.focus(), Some(1));
        assert_eq!(recs[0].events(), vec![ChrEvent::FocusGained, ChrEvent::FocusLost]);
        assert_eq!(recs[1].events(), vec![ChrEvent::FocusGained]);

        h.type_in(&[ESC, b'c']);
        assert_eq!(h.mux.focus(), Some(0));
        assert_eq!(
            recs[0].events(),
            vec![ChrEvent::FocusGained, ChrEvent::FocusLost, ChrEvent::FocusGained]
        );
        assert_eq!(recs[1].events(), vec![ChrEvent::FocusGained, ChrEvent::FocusLost]);

        h.type_in(b"z");
        assert_eq!(recs[0].data(), b"z");
        assert!(recs[1].data().is_empty());
    }

    #[test]
    fn escape_twice_sends_one_literal_escape() {
        let (mut h, recs) = Harness::with_consumers(1);
        h.type_in(&[ESC, ESC]);
        assert_eq!(recs[0].data(), vec![ESC]);
    }

    #[test]
    fn unknown_command_letter_is_plain_data() {
        let (mut h, recs) = Harness::with_consumers(1);
        h.type_in(&[ESC, b'q', b'r']);
        assert_eq!(recs[0].data(), b"qr");
    }

    #[test]
    fn escape_split_across_reads() {
        let (mut h, recs) = Harness::with_consumers(2);
        h.type_in(&[b'a', ESC]);
        h.type_in(b"cb");
        assert_eq!(recs[0].data(), b"a");
        assert_eq!(recs[1].data(), b"b");
    }

    #[test]
    fn full_consumer_buffers_then_drains_in_order() {
        let (mut h, recs) = Harness::with_consumers(1);
        recs[0].set_capacity(0);
        h.type_in(b"abc");
        assert!(recs[0].data().is_empty());

        recs[0].set_capacity(16);
        h.type_in(b"d");
        assert_eq!(recs[0].data(), b"abcd");
        assert_eq!(recs[0].0.borrow().violations, 0);
    }

    #[test]
    fn accept_input_drains_the_focused_buffer() {
        let (mut h, recs) = Harness::with_consumers(1);
        recs[0].set_capacity(0);
        h.type_in(b"xyz");
        recs[0].set_capacity(2);
        h.mux.accept_input();
        assert_eq!(recs[0].data(), b"xy");
        recs[0].set_capacity(2);
        h.mux.accept_input();
        assert_eq!(recs[0].data(), b"xyz");
    }

    #[test]
    fn full_ring_pushes_back_on_the_wrapped_backend() {
        let (mut h, recs) = Harness::with_consumers(1);
        recs[0].set_capacity(0);
        let burst: Vec<u8> = (0..40).map(|i| b'A' + (i % 26)).collect();
        h.type_in(&burst);
        // the ring took 32, the wrapped backend holds the rest
        assert_eq!(h.wire.0.borrow().slot.backlog_len(), 8);

        recs[0].set_capacity(100);
        h.mux.accept_input();
        assert_eq!(recs[0].data(), burst);
    }

    #[test]
    fn busy_consumer_does_not_block_another_slot() {
        let (mut h, recs) = Harness::with_consumers(2);
        recs[0].set_capacity(0);
        h.type_in(b"held");
        h.type_in(&[ESC, b'c']);
        h.type_in(b"free");
        assert_eq!(recs[1].data(), b"free");
        assert!(recs[0].data().is_empty());
    }

    #[test]
    fn fifth_consumer_is_rejected() {
        let (mut h, _recs) = Harness::with_consumers(4);
        let err = h.mux.set_frontend(Recorder::with_capacity(1).boxed()).unwrap_err();
        assert!(matches!(err, ChardevError::TooManyConsumers { max: 4 }));
        assert_eq!(h.mux.consumers(), 4);
    }

    #[test]
    fn every_clone_registers_into_the_same_mux() {
        let (h, _recs) = Harness::with_consumers(1);
        let mut other = h.mux.clone();
        other.set_frontend(Recorder::with_capacity(1).boxed()).unwrap();
        assert_eq!(h.mux.consumers(), 2);
    }

    #[test]
    fn help_names_control_escape_keys() {
        let text = help_text(0x01);
        assert!(text.starts_with("\n\r"));
        assert!(text.contains("C-a h    print this help\n\r"));
        assert!(text.contains("C-a C-a  sends C-a\n\r"));

        let text = help_text(0x1d);
        assert!(text.contains("Escape-Char set to Ascii: 0x1d"));
        assert!(text.contains("Escape-Char c    switch to the next consumer"));
    }

    #[test]
    fn help_command_is_written_after_dispatch() {
        let (mut h, recs) = Harness::with_consumers(1);
        h.type_in(&[ESC, b'h']);
        assert_eq!(h.wire.written_text(), help_text(ESC));
        assert!(recs[0].data().is_empty());
    }

    #[test]
    fn terminate_and_commit_reach_the_hooks() {
        let (mut h, _recs) = Harness::with_consumers(1);
        h.type_in(&[ESC, b's']);
        assert_eq!(*h.hooks.0.borrow(), vec!["commit"]);
        h.type_in(&[ESC, b'x']);
        assert_eq!(*h.hooks.0.borrow(), vec!["commit", "terminate"]);
        assert_eq!(h.wire.written(), b"Terminated\n\r");
    }

    #[test]
    fn break_goes_to_the_focused_consumer() {
        let (mut h, recs) = Harness::with_consumers(2);
        h.mux.set_focus(1).unwrap();
        h.type_in(&[ESC, b'b']);
        assert_eq!(
            recs[1].events(),
            vec![ChrEvent::FocusGained, ChrEvent::Break]
        );
        assert!(!recs[0].events().contains(&ChrEvent::Break));
    }

    #[test]
    fn set_focus_rejects_empty_slots() {
        let (h, _recs) = Harness::with_consumers(2);
        assert!(h.mux.set_focus(3).is_err());
        assert_eq!(h.mux.focus(), Some(0));
    }

    #[test]
    fn backend_events_reach_every_consumer() {
        let (h, recs) = Harness::with_consumers(3);
        h.wire.raise(ChrEvent::Reset);
        for rec in &recs {
            assert_eq!(rec.events().last(), Some(&ChrEvent::Reset));
        }
    }

    #[test]
    fn timestamps_prefix_each_new_line() {
        let (mut h, _recs) = Harness::with_consumers(1);
        h.type_in(&[ESC, b't']);
        assert!(h.mux.timestamps());

        // toggled mid-line: the current line is not stamped
        h.mux.write(b"typed\none\ntwo").unwrap();
        h.mux.write(b" more\n").unwrap();
        let text = h.wire.written_text();
        let lines: Vec<&str> = text.split('\n').collect();
        assert_eq!(lines[0], "typed");
        for (line, body) in lines[1..3].iter().zip(["one", "two more"]) {
            assert_eq!(&line[..4], "[00:");
            assert_eq!(&line[13..15], "] ");
            assert_eq!(&line[15..], body);
        }

        h.type_in(&[ESC, b't']);
        assert!(!h.mux.timestamps());
    }

    #[test]
    fn timestamp_prefix_format() {
        assert_eq!(timestamp_prefix(Duration::from_millis(0)), "[00:00:00.000] ");
        assert_eq!(
            timestamp_prefix(Duration::from_millis(3_723_045)),
            "[01:02:03.045] "
        );
    }

    #[test]
    fn writes_from_inside_delivery_are_deferred() {
        struct Echo(Mux);
        impl Frontend for Echo {
            fn can_receive(&mut self) -> usize {
                64
            }
            fn receive(&mut self, buf: &[u8]) {
                let mut mux = self.0.clone();
                assert_eq!(mux.write(buf).unwrap(), buf.len());
            }
        }

        let mut h = Harness::new(MuxOptions::default());
        let echo = Echo(h.mux.clone());
        h.mux.set_frontend(Box::new(echo)).unwrap();
        h.type_in(b"hi");
        assert_eq!(h.wire.written(), b"hi");
    }

    #[test]
    fn consumers_can_query_the_handle_from_focus_events() {
        struct Watcher {
            mux: Mux,
            seen: Rc<RefCell<Vec<(ChrEvent, Option<usize>, usize, bool)>>>,
        }
        impl Frontend for Watcher {
            fn can_receive(&mut self) -> usize {
                16
            }
            fn receive(&mut self, _buf: &[u8]) {}
            fn event(&mut self, event: ChrEvent) {
                let m = &self.mux;
                self.seen
                    .borrow_mut()
                    .push((event, m.focus(), m.consumers(), m.timestamps()));
            }
        }

        let mut h = Harness::new(MuxOptions::default());
        let seen = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..2 {
            let watcher = Watcher {
                mux: h.mux.clone(),
                seen: seen.clone(),
            };
            h.mux.set_frontend(Box::new(watcher)).unwrap();
        }
        h.type_in(&[ESC, b'c']);

        assert_eq!(
            *seen.borrow(),
            vec![
                (ChrEvent::FocusGained, Some(0), 1, false),
                (ChrEvent::FocusLost, Some(1), 2, false),
                (ChrEvent::FocusGained, Some(1), 2, false),
            ]
        );
    }

    #[test]
    fn stamped_write_reports_only_what_was_kept() {
        struct Flood {
            mux: Mux,
            payload: Vec<u8>,
            accepted: Rc<Cell<Option<usize>>>,
        }
        impl Frontend for Flood {
            fn can_receive(&mut self) -> usize {
                16
            }
            fn receive(&mut self, _buf: &[u8]) {
                let mut mux = self.mux.clone();
                self.accepted.set(Some(mux.write(&self.payload).unwrap()));
            }
        }

        let payload: Vec<u8> = b"abcdefghi\n".repeat(500);
        let accepted = Rc::new(Cell::new(None));
        let mut h = Harness::new(MuxOptions::default());
        let flood = Flood {
            mux: h.mux.clone(),
            payload: payload.clone(),
            accepted: accepted.clone(),
        };
        h.mux.set_frontend(Box::new(flood)).unwrap();
        h.type_in(&[ESC, b't']);
        h.type_in(b"g");

        // the wrapped backend was busy, so only what fit the queue is taken
        let n = accepted.get().unwrap();
        assert!(n > 0 && n < payload.len(), "accepted {n}");
        assert_eq!(unstamp(&h.wire.written_text()), payload[..n]);

        // the caller retries the rest once dispatch is over
        assert_eq!(h.mux.write(&payload[n..]).unwrap(), payload.len() - n);
        assert_eq!(unstamp(&h.wire.written_text()), payload);
    }

    /// Strip `[HH:MM:SS.mmm] ` from every line after the first.
    fn unstamp(text: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, line) in text.split('\n').enumerate() {
            if i > 0 {
                out.push(b'\n');
                if !line.is_empty() {
                    assert!(line.starts_with("[00:"), "unstamped line {line:?}");
                    out.extend_from_slice(&line.as_bytes()[15..]);
                    continue;
                }
            }
            out.extend_from_slice(line.as_bytes());
        }
        out
    }

    #[test]
    fn writes_and_close_pass_through() {
        let (mut h, _recs) = Harness::with_consumers(1);
        assert_eq!(h.mux.write(b"out").unwrap(), 3);
        assert_eq!(h.wire.written(), b"out");
        assert!(h.mux.ioctl(Ioctl::GetModemLines).unwrap_err().is_unsupported());
        h.mux.close();
        assert!(h.wire.0.borrow().closed);
    }

    #[test]
    fn ring_cursors_wrap_without_losing_order() {
        let mut ring = Ring::new(4);
        ring.prod = usize::MAX - 1;
        ring.cons = usize::MAX - 1;
        for b in 1..=4 {
            assert!(!ring.push(b));
        }
        assert!(ring.is_full());
        assert!(ring.push(5));
        let drained: Vec<u8> = std::iter::from_fn(|| ring.pop()).collect();
        assert_eq!(drained, vec![2, 3, 4, 5]);
    }

    #[test]
    fn options_deserialize_with_defaults_and_validate() {
        let opts: MuxOptions = serde_json::from_str(r#"{"escape_char": 29}"#).unwrap();
        assert_eq!(opts.escape_char, 29);
        assert_eq!(opts.max_slots, DEFAULT_MAX_SLOTS);
        assert_eq!(opts.buffer_size, DEFAULT_BUFFER_SIZE);

        let bad = MuxOptions {
            buffer_size: 24,
            ..MuxOptions::default()
        };
        assert!(matches!(bad.validate(), Err(ChardevError::InvalidOptions(_))));
        assert!(Mux::new(Box::new(FakeInner::default()), bad).is_err());
    }
}
