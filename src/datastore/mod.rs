//! Host-side mirror of device values.
//!
//! Entries come in three kinds: memory-backed variables, RPVs addressed
//! by id, and aliases derived from one of the other two.

pub mod alias;
pub mod entry;
pub mod pending;
pub mod store;
pub mod variable;

pub use alias::AliasDef;
pub use entry::{Entry, EntryId, EntryKind, WatcherId};
pub use pending::{MAX_PENDING_WRITES, PendingWrite, WriteId, WriteOutcome};
pub use store::{ValueCallback, ValueStore};
pub use variable::{EncodedWrite, EnumDef, RpvDef, VariableDef};
