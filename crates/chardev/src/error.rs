//! Error types for character-device backends.

use std::io;
use std::path::PathBuf;

/// Result type alias for backend operations.
pub type Result<T> = std::result::Result<T, ChardevError>;

/// Errors surfaced by backend construction and side-channel requests.
///
/// Transient transport faults (a peer hanging up, an interrupted accept)
/// never show up here; backends absorb those and move to a reconnecting
/// state instead.
#[derive(Debug, thiserror::Error)]
pub enum ChardevError {
    // =========================================================================
    // Construction
    // =========================================================================
    /// The address string could not be parsed.
    #[error("invalid chardev address '{spec}': {reason}")]
    InvalidAddress { spec: String, reason: String },

    /// A device node, pipe or file could not be opened.
    #[error("failed to open '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A listening or datagram socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A listening socket failed while waiting for its first peer.
    #[error("failed to accept on {addr}: {source}")]
    Accept {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// An outbound connection could not be established.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Multiplexer options are out of range.
    #[error("invalid multiplexer options: {0}")]
    InvalidOptions(String),

    /// The process-wide stdio backend is already claimed.
    #[error("stdio backend is already in use")]
    StdioBusy,

    // =========================================================================
    // Runtime
    // =========================================================================
    /// The backend does not implement the requested ioctl.
    #[error("operation not supported by this backend")]
    Unsupported,

    /// Every multiplexer slot is already taken.
    #[error("multiplexer already has the maximum of {max} consumers")]
    TooManyConsumers { max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),
}

impl ChardevError {
    pub(crate) fn invalid(spec: &str, reason: impl Into<String>) -> Self {
        ChardevError::InvalidAddress {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn open(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ChardevError::Open {
            path: path.into(),
            source,
        }
    }

    /// True for the "backend does not do that" outcome, which callers are
    /// expected to fall back from rather than treat as a failure.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ChardevError::Unsupported)
    }
}
