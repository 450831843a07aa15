//! Port traits: the hexagonal boundary between the sync core and the
//! outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ SyncService (core)
//! ```
//!
//! The transport layer implements [`Link`]; time comes in through
//! [`Clock`].  [`SyncService`](super::service::SyncService) consumes both
//! via generics, so the core never touches a socket or a system timer
//! directly and is testable with in-process mocks.

use core::fmt;

// ───────────────────────────────────────────────────────────────
// Link port (driven adapter: core ↔ device)
// ───────────────────────────────────────────────────────────────

/// Half-duplex byte link to the device.
///
/// Implementations must not block: `recv` returns whatever bytes have
/// arrived since the last call, or `None`.
pub trait Link {
    /// Queue `bytes` for transmission.
    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Bytes received since the last call, if any.  Frame boundaries are
    /// not preserved.
    fn recv(&mut self) -> Option<Vec<u8>>;

    /// False once the connection layer has torn the link down.
    fn is_up(&self) -> bool;
}

/// Errors from [`Link::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The link is not connected.
    Down,
    /// The outgoing queue is full.
    Full,
    /// The transport failed.
    Io,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Down => write!(f, "link down"),
            Self::Full => write!(f, "link queue full"),
            Self::Io => write!(f, "I/O error"),
        }
    }
}

impl std::error::Error for LinkError {}

/// A link that is never up.  Useful as a placeholder before the
/// connection layer hands over a real transport.
pub struct NullLink;

impl Link for NullLink {
    fn send(&mut self, _bytes: &[u8]) -> Result<(), LinkError> {
        Err(LinkError::Down)
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn is_up(&self) -> bool {
        false
    }
}

// ───────────────────────────────────────────────────────────────
// Clock port
// ───────────────────────────────────────────────────────────────

/// Monotonic time source, in microseconds.
pub trait Clock {
    fn now_us(&self) -> u64;
}

/// Host clock backed by `std::time::Instant`.
pub struct MonotonicClock {
    start: std::time::Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}
