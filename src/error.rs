//! Unified error types for the sync core.
//!
//! A single `Error` enum that every subsystem converts into, so the
//! per-tick driver handles failures uniformly.  Variants are `Copy` so
//! they can be carried inside completions and logged without allocation.
//! Nothing here is fatal to the link: a protocol error costs one
//! transaction, never the connection.

use core::fmt;

use crate::datastore::EntryId;
use crate::protocol::{EmbeddedDataType, ResponseCode};

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the crate funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Byte-range bookkeeping failed.
    Range(RangeError),
    /// A request or response payload was malformed.
    Protocol(ProtocolError),
    /// A value could not be encoded or decoded.
    Codec(CodecError),
    /// A transaction did not complete on the link.
    Dispatch(DispatchError),
    /// The value store rejected an operation.
    Store(StoreError),
    /// Configuration is invalid.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range(e) => write!(f, "range: {e}"),
            Self::Protocol(e) => write!(f, "protocol: {e}"),
            Self::Codec(e) => write!(f, "codec: {e}"),
            Self::Dispatch(e) => write!(f, "dispatch: {e}"),
            Self::Store(e) => write!(f, "store: {e}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Byte-range errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// Ranges must be at least one byte long.
    ZeroLength,
    /// `address + length` does not fit in 64 bits.
    AddressOverflow,
    /// The requested window is not fully covered by one stored range.
    NotContained { address: u64, len: usize },
    /// The store only tracks spans and holds no bytes.
    NoData,
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroLength => write!(f, "zero-length range"),
            Self::AddressOverflow => write!(f, "address range overflows"),
            Self::NotContained { address, len } => {
                write!(f, "{len} bytes at 0x{address:X} not available")
            }
            Self::NoData => write!(f, "store does not retain data"),
        }
    }
}

impl std::error::Error for RangeError {}

impl From<RangeError> for Error {
    fn from(e: RangeError) -> Self {
        Self::Range(e)
    }
}

// ---------------------------------------------------------------------------
// Protocol errors
// ---------------------------------------------------------------------------

/// Transaction-scoped decode/encode failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// A request payload could not be built or parsed.
    MalformedRequest(&'static str),
    /// A response payload could not be parsed.
    MalformedResponse(&'static str),
    /// Frame is shorter than its header claims.
    Truncated,
    /// CRC32 trailer does not match the frame content.
    BadCrc,
    UnknownCommand(u8),
    UnknownSubfunction { command: u8, subfn: u8 },
    UnknownResponseCode(u8),
    /// RPV id has no configured type.
    UnknownRpvId(u16),
    /// Address does not fit in the configured address width.
    AddressTooWide(u64),
    /// Response code is not `Ok`; the payload carries nothing.
    NotOk(ResponseCode),
    /// Value codec failure while building or parsing a payload.
    Codec(CodecError),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedRequest(msg) => write!(f, "malformed request: {msg}"),
            Self::MalformedResponse(msg) => write!(f, "malformed response: {msg}"),
            Self::Truncated => write!(f, "truncated frame"),
            Self::BadCrc => write!(f, "CRC mismatch"),
            Self::UnknownCommand(c) => write!(f, "unknown command 0x{c:02X}"),
            Self::UnknownSubfunction { command, subfn } => {
                write!(f, "unknown subfunction 0x{subfn:02X} for command 0x{command:02X}")
            }
            Self::UnknownResponseCode(c) => write!(f, "unknown response code {c}"),
            Self::UnknownRpvId(id) => write!(f, "unknown RPV id 0x{id:04X}"),
            Self::AddressTooWide(a) => write!(f, "address 0x{a:X} exceeds address width"),
            Self::NotOk(code) => write!(f, "device answered {code}"),
            Self::Codec(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<CodecError> for ProtocolError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

// ---------------------------------------------------------------------------
// Value codec errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Declared type exists but has no runtime codec (128/256-bit).
    NoCodec(EmbeddedDataType),
    /// Input slice length does not match the type size.
    WrongSize { expected: usize, got: usize },
    /// Value does not fit the target type or bitfield.
    OutOfRange,
    /// NaN or infinity written to an integer type.
    NotFinite,
    /// Bitfield does not fit inside the declared type.
    InvalidBitfield,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCodec(t) => write!(f, "no codec for type {t:?}"),
            Self::WrongSize { expected, got } => {
                write!(f, "expected {expected} bytes, got {got}")
            }
            Self::OutOfRange => write!(f, "value out of range"),
            Self::NotFinite => write!(f, "value is not finite"),
            Self::InvalidBitfield => write!(f, "invalid bitfield"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

// ---------------------------------------------------------------------------
// Dispatch errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// No response within the request timeout.
    Timeout,
    /// The link went down while the request was queued or in flight.
    LinkDown,
    /// The link refused the outgoing bytes.
    SendFailed,
    /// The response frame could not be decoded.
    BadFrame(ProtocolError),
    /// The response does not answer the in-flight request.
    Mismatch,
    /// The dispatcher was reset with the request outstanding.
    Cancelled,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::LinkDown => write!(f, "link down"),
            Self::SendFailed => write!(f, "send failed"),
            Self::BadFrame(e) => write!(f, "bad response frame: {e}"),
            Self::Mismatch => write!(f, "response does not match request"),
            Self::Cancelled => write!(f, "request cancelled"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<DispatchError> for Error {
    fn from(e: DispatchError) -> Self {
        Self::Dispatch(e)
    }
}

// ---------------------------------------------------------------------------
// Value store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    UnknownEntry(EntryId),
    /// Another entry already uses this display path.
    DuplicatePath,
    /// Alias targets must be variables or RPVs.
    AliasOfAlias,
    /// Alias gain must be finite and non-zero, min must not exceed max.
    InvalidAlias,
    /// The entry's pending-write queue is full.
    WriteQueueFull(EntryId),
    /// The entry kind cannot be written directly.
    NotWritable(EntryId),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownEntry(id) => write!(f, "unknown entry {id}"),
            Self::DuplicatePath => write!(f, "duplicate display path"),
            Self::AliasOfAlias => write!(f, "alias cannot target an alias"),
            Self::InvalidAlias => write!(f, "invalid alias parameters"),
            Self::WriteQueueFull(id) => write!(f, "write queue full for entry {id}"),
            Self::NotWritable(id) => write!(f, "entry {id} is not writable"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
