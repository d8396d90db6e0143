//! Side-channel requests a device model can issue to a backend.

/// Parity setting for [`SerialParams`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Line coding requested by an emulated UART.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialParams {
    pub speed: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
}

impl Default for SerialParams {
    fn default() -> Self {
        SerialParams {
            speed: 115_200,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: 1,
        }
    }
}

/// Modem control/status lines, as the `TIOCM_*` bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModemLines(pub u32);

impl ModemLines {
    pub const DTR: u32 = libc::TIOCM_DTR as u32;
    pub const RTS: u32 = libc::TIOCM_RTS as u32;
    pub const CTS: u32 = libc::TIOCM_CTS as u32;
    pub const CAR: u32 = libc::TIOCM_CAR as u32;
    pub const RNG: u32 = libc::TIOCM_RNG as u32;
    pub const DSR: u32 = libc::TIOCM_DSR as u32;

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// EPP cycle type for parallel-port block transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EppCycle {
    Data,
    Address,
}

/// A typed ioctl request. Backends answer the ones they understand and
/// return [`crate::ChardevError::Unsupported`] for the rest.
#[derive(Debug)]
pub enum Ioctl<'a> {
    SetSerialParams(SerialParams),
    SetBreak(bool),
    GetModemLines,
    SetModemLines(ModemLines),
    PpReadData,
    PpWriteData(u8),
    PpReadControl,
    PpWriteControl(u8),
    PpReadStatus,
    PpEppRead { cycle: EppCycle, buf: &'a mut [u8] },
    PpEppWrite { cycle: EppCycle, buf: &'a [u8] },
    /// `true` switches the data lines to input (reverse) direction.
    PpDataDir(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlReply {
    Done,
    Byte(u8),
    ModemLines(ModemLines),
}
