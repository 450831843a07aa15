//! Host → device write intents.

use core::fmt;

use heapless::Deque;

use crate::protocol::Value;

use super::entry::EntryId;

/// Hard upper bound on queued writes per entry.  The configured depth
/// may be lower.
pub const MAX_PENDING_WRITES: usize = 32;

/// Store-assigned id of one write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriteId(pub(crate) u64);

impl fmt::Display for WriteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "write-{}", self.0)
    }
}

/// One queued write.  Only the head of an entry's queue is active.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingWrite {
    pub id: WriteId,
    pub entry: EntryId,
    /// Value in the entry's own units (device units for variables and
    /// RPVs, user units for aliases).
    pub value: Value,
    pub created_us: u64,
    /// For an alias write, the translated write queued on the target.
    pub linked: Option<WriteId>,
}

/// How a write ended.  Delivered through
/// [`ValueStore::take_write_outcomes`](super::ValueStore::take_write_outcomes).
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub write: WriteId,
    pub entry: EntryId,
    pub value: Value,
    pub success: bool,
    /// Human-readable failure reason; `None` on success.
    pub reason: Option<String>,
    pub created_us: u64,
    pub completed_us: u64,
}

pub(crate) type WriteQueue = Deque<PendingWrite, MAX_PENDING_WRITES>;
