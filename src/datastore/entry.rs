//! Host-side mirror entries.

use core::fmt;

use crate::protocol::{EmbeddedDataType, Value};

use super::alias::AliasDef;
use super::variable::{RpvDef, VariableDef};

/// Opaque, store-assigned entry id.  Never reused within one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) u32);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Caller-chosen id of a watcher (a GUI panel, an API client, a test).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(pub u32);

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    Variable(VariableDef),
    Rpv(RpvDef),
    Alias(AliasDef),
}

/// One mirrored value.  The id and kind never change after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    id: EntryId,
    path: String,
    kind: EntryKind,
    value: Option<Value>,
}

impl Entry {
    pub(crate) fn new(id: EntryId, path: String, kind: EntryKind) -> Self {
        Self {
            id,
            path,
            kind,
            value: None,
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Display path, e.g. `/var/motor/speed`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    /// Last value received from (or optimistically written to) the device.
    pub fn value(&self) -> Option<Value> {
        self.value
    }

    pub(crate) fn set_value(&mut self, value: Value) {
        self.value = Some(value);
    }

    /// Declared type of variables and RPVs.  Aliases take their target's
    /// type; see [`ValueStore::data_type`](super::ValueStore::data_type).
    pub fn data_type(&self) -> Option<EmbeddedDataType> {
        match &self.kind {
            EntryKind::Variable(v) => Some(v.dtype),
            EntryKind::Rpv(r) => Some(r.dtype),
            EntryKind::Alias(_) => None,
        }
    }

    pub fn as_variable(&self) -> Option<&VariableDef> {
        match &self.kind {
            EntryKind::Variable(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_rpv(&self) -> Option<&RpvDef> {
        match &self.kind {
            EntryKind::Rpv(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_alias(&self) -> Option<&AliasDef> {
        match &self.kind {
            EntryKind::Alias(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_alias(&self) -> bool {
        matches!(self.kind, EntryKind::Alias(_))
    }
}
