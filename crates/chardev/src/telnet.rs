//! In-band Telnet option handling for stream sockets.
//!
//! Only what a serial console needs: the server announces character mode
//! right after accepting, and inbound option negotiation is stripped from
//! the data stream. `IAC IAC` is a literal 0xff; `IAC BREAK` becomes a
//! break event.

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const BREAK: u8 = 243;

pub const OPT_BINARY: u8 = 0;
pub const OPT_ECHO: u8 = 1;
pub const OPT_SUPPRESS_GO_AHEAD: u8 = 3;

/// Sent to a freshly accepted client: WILL ECHO, WILL SGA, WILL BINARY,
/// DO BINARY.
#[rustfmt::skip]
pub const SERVER_PREAMBLE: [u8; 12] = [
    IAC, WILL, OPT_ECHO,
    IAC, WILL, OPT_SUPPRESS_GO_AHEAD,
    IAC, WILL, OPT_BINARY,
    IAC, DO, OPT_BINARY,
];

// Filter counter values. Always in 0..=3.
const OFF: u8 = 0;
const SCANNING: u8 = 1;
const AFTER_IAC: u8 = 2;
const MID_COMMAND: u8 = 3;

/// Streaming filter state. Survives across reads so a sequence split
/// between two `recv` calls is still recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelnetFilter {
    state: u8,
}

impl TelnetFilter {
    pub fn new(enabled: bool) -> Self {
        TelnetFilter {
            state: if enabled { SCANNING } else { OFF },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state != OFF
    }

    /// Restart scanning, e.g. for a newly accepted peer.
    pub fn reset(&mut self) {
        if self.is_enabled() {
            self.state = SCANNING;
        }
    }

    /// Strip negotiation from `buf` in place. Returns how many breaks were
    /// seen. Surviving bytes keep their order; the buffer only shrinks.
    pub fn filter(&mut self, buf: &mut Vec<u8>) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        let mut breaks = 0;
        let mut keep = 0;
        for i in 0..buf.len() {
            let byte = buf[i];
            if self.state >= AFTER_IAC {
                if byte == IAC && self.state == AFTER_IAC {
                    buf[keep] = byte;
                    keep += 1;
                    self.state = SCANNING;
                } else {
                    if byte == BREAK && self.state == AFTER_IAC {
                        breaks += 1;
                        self.state += 1;
                    }
                    self.state += 1;
                }
                if self.state > MID_COMMAND {
                    self.state = SCANNING;
                }
            } else if byte == IAC {
                self.state = AFTER_IAC;
            } else {
                buf[keep] = byte;
                keep += 1;
            }
        }
        buf.truncate(keep);
        breaks
    }
}
