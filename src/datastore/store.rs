//! The value store: entries, watchers and pending writes.
//!
//! ```text
//!   MemoryReader ── set_value ──────────▶ ┌────────────┐ ──▶ watcher callbacks
//!                                          │ ValueStore │
//!   API client ─── update_target_value ──▶ │  entries   │ ──▶ MemoryWriter
//!                                          │  watchers  │       (active_write)
//!                                          │  writes    │
//!                                          └────────────┘
//! ```
//!
//! Watchers live in their own table keyed by entry id, apart from the
//! entries, so a callback can borrow the entry it is told about.  Every
//! change to the watched set bumps `watch_generation`, which the reader
//! uses to rebuild its address-sorted cursor.

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};

use crate::dispatch::OutcomeQueue;
use crate::error::StoreError;
use crate::protocol::{EmbeddedDataType, Value};

use super::alias::AliasDef;
use super::entry::{Entry, EntryId, EntryKind, WatcherId};
use super::pending::{MAX_PENDING_WRITES, PendingWrite, WriteId, WriteOutcome, WriteQueue};
use super::variable::{RpvDef, VariableDef};

/// Invoked with the watcher id and the entry after every value update.
pub type ValueCallback = Box<dyn FnMut(WatcherId, &Entry)>;

pub struct ValueStore {
    entries: BTreeMap<EntryId, Entry>,
    by_path: HashMap<String, EntryId>,
    /// Target id → aliases that point at it.
    aliases_of: HashMap<EntryId, Vec<EntryId>>,
    watchers: BTreeMap<EntryId, Vec<(WatcherId, ValueCallback)>>,
    writes: BTreeMap<EntryId, WriteQueue>,
    outcomes: OutcomeQueue<WriteOutcome>,
    write_queue_depth: usize,
    watch_generation: u64,
    next_entry: u32,
    next_write: u64,
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new(MAX_PENDING_WRITES)
    }
}

impl ValueStore {
    /// `write_queue_depth` is clamped to `1..=MAX_PENDING_WRITES`.
    pub fn new(write_queue_depth: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            by_path: HashMap::new(),
            aliases_of: HashMap::new(),
            watchers: BTreeMap::new(),
            writes: BTreeMap::new(),
            outcomes: OutcomeQueue::new("write"),
            write_queue_depth: write_queue_depth.clamp(1, MAX_PENDING_WRITES),
            watch_generation: 0,
            next_entry: 0,
            next_write: 0,
        }
    }

    // ── Entries ───────────────────────────────────────────────

    pub fn add_entry(&mut self, path: impl Into<String>, kind: EntryKind) -> Result<EntryId, StoreError> {
        let path = path.into();
        if self.by_path.contains_key(&path) {
            return Err(StoreError::DuplicatePath);
        }
        if let EntryKind::Alias(def) = &kind {
            def.validate()?;
            let target = self
                .entries
                .get(&def.target)
                .ok_or(StoreError::UnknownEntry(def.target))?;
            if target.is_alias() {
                return Err(StoreError::AliasOfAlias);
            }
        }

        let id = EntryId(self.next_entry);
        self.next_entry += 1;
        if let EntryKind::Alias(def) = &kind {
            self.aliases_of.entry(def.target).or_default().push(id);
        }
        self.by_path.insert(path.clone(), id);
        self.entries.insert(id, Entry::new(id, path, kind));
        Ok(id)
    }

    pub fn add_variable(&mut self, path: impl Into<String>, def: VariableDef) -> Result<EntryId, StoreError> {
        self.add_entry(path, EntryKind::Variable(def))
    }

    pub fn add_rpv(&mut self, path: impl Into<String>, def: RpvDef) -> Result<EntryId, StoreError> {
        self.add_entry(path, EntryKind::Rpv(def))
    }

    pub fn add_alias(&mut self, path: impl Into<String>, def: AliasDef) -> Result<EntryId, StoreError> {
        self.add_entry(path, EntryKind::Alias(def))
    }

    pub fn get_entry(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub fn find(&self, path: &str) -> Option<EntryId> {
        self.by_path.get(path).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Declared type, following an alias to its target.
    pub fn data_type(&self, id: EntryId) -> Option<EmbeddedDataType> {
        let entry = self.entries.get(&id)?;
        match entry.kind() {
            EntryKind::Alias(def) => self.entries.get(&def.target)?.data_type(),
            _ => entry.data_type(),
        }
    }

    // ── Watching ──────────────────────────────────────────────

    /// Register `callback` for `watcher` on entry `id`.  Registering the
    /// same watcher again replaces its callback.
    pub fn start_watching(
        &mut self,
        id: EntryId,
        watcher: WatcherId,
        callback: impl FnMut(WatcherId, &Entry) + 'static,
    ) -> Result<(), StoreError> {
        if !self.entries.contains_key(&id) {
            return Err(StoreError::UnknownEntry(id));
        }
        let list = self.watchers.entry(id).or_default();
        if let Some(slot) = list.iter_mut().find(|(w, _)| *w == watcher) {
            slot.1 = Box::new(callback);
            return Ok(());
        }
        list.push((watcher, Box::new(callback)));
        self.watch_generation += 1;
        debug!("Store: {} watches {}", watcher, id);
        Ok(())
    }

    /// Returns false when `watcher` was not watching `id`.
    pub fn stop_watching(&mut self, id: EntryId, watcher: WatcherId) -> bool {
        let Some(list) = self.watchers.get_mut(&id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(w, _)| *w != watcher);
        let removed = list.len() != before;
        if list.is_empty() {
            self.watchers.remove(&id);
        }
        if removed {
            self.watch_generation += 1;
            debug!("Store: {} stopped watching {}", watcher, id);
        }
        removed
    }

    /// Remove `watcher` from every entry; returns how many it watched.
    pub fn stop_watching_all(&mut self, watcher: WatcherId) -> usize {
        let ids: Vec<EntryId> = self.watchers.keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.stop_watching(*id, watcher))
            .count()
    }

    fn has_own_watchers(&self, id: EntryId) -> bool {
        self.watchers.get(&id).is_some_and(|l| !l.is_empty())
    }

    /// True when the entry or any alias of it has a watcher.
    pub fn is_watched(&self, id: EntryId) -> bool {
        self.has_own_watchers(id)
            || self
                .aliases_of
                .get(&id)
                .is_some_and(|aliases| aliases.iter().any(|a| self.has_own_watchers(*a)))
    }

    pub fn watcher_count(&self, id: EntryId) -> usize {
        self.watchers.get(&id).map_or(0, Vec::len)
    }

    /// Bumped whenever the set of watched entries may have changed.
    pub fn watch_generation(&self) -> u64 {
        self.watch_generation
    }

    /// Watched variables (directly or through an alias), by id.
    pub fn watched_variables(&self) -> Vec<EntryId> {
        self.entries
            .values()
            .filter(|e| e.as_variable().is_some() && self.is_watched(e.id()))
            .map(Entry::id)
            .collect()
    }

    /// Watched RPVs (directly or through an alias), by id.
    pub fn watched_rpvs(&self) -> Vec<EntryId> {
        self.entries
            .values()
            .filter(|e| e.as_rpv().is_some() && self.is_watched(e.id()))
            .map(Entry::id)
            .collect()
    }

    // ── Device → host ─────────────────────────────────────────

    /// Record a value read from the device and notify watchers of the
    /// entry and of every alias pointing at it.
    pub fn set_value(&mut self, id: EntryId, value: Value) -> Result<(), StoreError> {
        let entry = self.entries.get_mut(&id).ok_or(StoreError::UnknownEntry(id))?;
        if entry.is_alias() {
            return Err(StoreError::NotWritable(id));
        }
        entry.set_value(value);
        self.notify(id);

        let aliases = self.aliases_of.get(&id).cloned().unwrap_or_default();
        for alias_id in aliases {
            let Some(alias) = self.entries.get_mut(&alias_id) else {
                continue;
            };
            if let Some(def) = alias.as_alias() {
                let user_value = def.compute_user_value(value);
                alias.set_value(user_value);
                self.notify(alias_id);
            }
        }
        Ok(())
    }

    fn notify(&mut self, id: EntryId) {
        let (Some(entry), Some(list)) = (self.entries.get(&id), self.watchers.get_mut(&id)) else {
            return;
        };
        for (watcher, callback) in list.iter_mut() {
            callback(*watcher, entry);
        }
    }

    // ── Host → device ─────────────────────────────────────────

    /// Queue a write of `value` to entry `id`.
    ///
    /// Writing an alias queues a bookkeeping write on the alias and the
    /// translated write on its target; the alias write completes with
    /// the target's.  A full queue rejects the write immediately.
    pub fn update_target_value(&mut self, id: EntryId, value: Value, now_us: u64) -> Result<WriteId, StoreError> {
        let entry = self.entries.get(&id).ok_or(StoreError::UnknownEntry(id))?;
        match entry.kind() {
            EntryKind::Alias(def) => {
                let def = *def;
                if !self.has_room(id) {
                    return Err(StoreError::WriteQueueFull(id));
                }
                if !self.has_room(def.target) {
                    return Err(StoreError::WriteQueueFull(def.target));
                }
                let translated = def.compute_device_value(value);
                let target_write = self.enqueue(def.target, translated, now_us, None)?;
                self.enqueue(id, value, now_us, Some(target_write))
            }
            EntryKind::Variable(_) | EntryKind::Rpv(_) => self.enqueue(id, value, now_us, None),
        }
    }

    fn has_room(&self, id: EntryId) -> bool {
        self.writes.get(&id).map_or(0, WriteQueue::len) < self.write_queue_depth
    }

    fn enqueue(&mut self, id: EntryId, value: Value, now_us: u64, linked: Option<WriteId>) -> Result<WriteId, StoreError> {
        if !self.has_room(id) {
            warn!("Store: write queue full for {}", id);
            return Err(StoreError::WriteQueueFull(id));
        }
        let write = PendingWrite {
            id: WriteId(self.next_write),
            entry: id,
            value,
            created_us: now_us,
            linked,
        };
        self.writes
            .entry(id)
            .or_default()
            .push_back(write)
            .map_err(|_| StoreError::WriteQueueFull(id))?;
        self.next_write += 1;
        Ok(write.id)
    }

    /// Variables and RPVs with at least one queued write, by id.
    pub fn entries_with_pending_writes(&self) -> Vec<EntryId> {
        self.writes
            .iter()
            .filter(|(id, q)| !q.is_empty() && self.entries.get(id).is_some_and(|e| !e.is_alias()))
            .map(|(id, _)| *id)
            .collect()
    }

    /// The write at the head of the entry's queue.
    pub fn active_write(&self, id: EntryId) -> Option<&PendingWrite> {
        self.writes.get(&id)?.front()
    }

    pub fn pending_write_count(&self, id: EntryId) -> usize {
        self.writes.get(&id).map_or(0, WriteQueue::len)
    }

    /// Finish the active write of `id`, and the alias write linked to it.
    /// Does not touch the cached value; the caller decides what the
    /// device now holds.
    pub fn complete_active_write(
        &mut self,
        id: EntryId,
        result: Result<(), String>,
        now_us: u64,
    ) -> Option<WriteOutcome> {
        let write = self.writes.get_mut(&id)?.pop_front()?;
        let outcome = Self::outcome(&write, &result, now_us);
        self.outcomes.push(outcome.clone());

        // Alias writes reach the target queue in the same order they
        // reach their own queue, so a linked write is always at the head.
        let aliases = self.aliases_of.get(&id).cloned().unwrap_or_default();
        for alias_id in aliases {
            let Some(queue) = self.writes.get_mut(&alias_id) else {
                continue;
            };
            if queue.front().is_some_and(|w| w.linked == Some(write.id)) {
                if let Some(alias_write) = queue.pop_front() {
                    self.outcomes
                        .push(Self::outcome(&alias_write, &result, now_us));
                }
            }
        }
        Some(outcome)
    }

    fn outcome(write: &PendingWrite, result: &Result<(), String>, now_us: u64) -> WriteOutcome {
        WriteOutcome {
            write: write.id,
            entry: write.entry,
            value: write.value,
            success: result.is_ok(),
            reason: result.as_ref().err().cloned(),
            created_us: write.created_us,
            completed_us: now_us,
        }
    }

    /// Drain finished writes, oldest first.
    pub fn take_write_outcomes(&mut self) -> Vec<WriteOutcome> {
        self.outcomes.drain()
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Drop every entry (device disconnected or firmware changed).
    /// Queued writes complete as failed.
    pub fn clear(&mut self, now_us: u64) {
        let writes = core::mem::take(&mut self.writes);
        for (_, mut queue) in writes {
            while let Some(w) = queue.pop_front() {
                self.outcomes
                    .push(Self::outcome(&w, &Err("entries cleared".into()), now_us));
            }
        }
        self.entries.clear();
        self.by_path.clear();
        self.aliases_of.clear();
        self.watchers.clear();
        self.watch_generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::protocol::Endianness;

    fn var(addr: u64) -> VariableDef {
        VariableDef::new(addr, EmbeddedDataType::Uint32, Endianness::Little)
    }

    fn recorder() -> (Rc<RefCell<Vec<(WatcherId, Option<Value>)>>>, impl FnMut(WatcherId, &Entry) + 'static) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        (log, move |w: WatcherId, e: &Entry| sink.borrow_mut().push((w, e.value())))
    }

    #[test]
    fn duplicate_path_rejected() {
        let mut s = ValueStore::default();
        s.add_variable("/a", var(0)).unwrap();
        assert_eq!(s.add_variable("/a", var(4)), Err(StoreError::DuplicatePath));
    }

    #[test]
    fn alias_of_alias_rejected() {
        let mut s = ValueStore::default();
        let v = s.add_variable("/v", var(0)).unwrap();
        let a = s.add_alias("/a", AliasDef::new(v)).unwrap();
        assert_eq!(s.add_alias("/b", AliasDef::new(a)), Err(StoreError::AliasOfAlias));
        assert_eq!(s.data_type(a), Some(EmbeddedDataType::Uint32));
    }

    #[test]
    fn watching_is_idempotent() {
        let mut s = ValueStore::default();
        let v = s.add_variable("/v", var(0)).unwrap();
        let (log, cb) = recorder();
        let (_, cb2) = recorder();
        s.start_watching(v, WatcherId(1), cb).unwrap();
        let generation = s.watch_generation();
        s.start_watching(v, WatcherId(1), cb2).unwrap();
        assert_eq!(s.watch_generation(), generation);
        assert_eq!(s.watcher_count(v), 1);
        s.set_value(v, Value::UInt(3)).unwrap();
        // The replacement callback got the update, not the original.
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn set_value_notifies_entry_and_aliases() {
        let mut s = ValueStore::default();
        let v = s.add_variable("/v", var(0)).unwrap();
        let a = s
            .add_alias("/a", AliasDef::new(v).with_gain(2.0).with_offset(1.0))
            .unwrap();
        let (log, cb) = recorder();
        s.start_watching(a, WatcherId(9), cb).unwrap();
        assert!(s.is_watched(v));
        assert_eq!(s.watched_variables(), vec![v]);

        s.set_value(v, Value::UInt(10)).unwrap();
        assert_eq!(*log.borrow(), vec![(WatcherId(9), Some(Value::Float(21.0)))]);
        assert_eq!(s.get_entry(v).unwrap().value(), Some(Value::UInt(10)));
    }

    #[test]
    fn unwatch_clears_watched_set() {
        let mut s = ValueStore::default();
        let v = s.add_variable("/v", var(0)).unwrap();
        let (_, cb) = recorder();
        s.start_watching(v, WatcherId(1), cb).unwrap();
        assert!(s.stop_watching(v, WatcherId(1)));
        assert!(!s.stop_watching(v, WatcherId(1)));
        assert!(s.watched_variables().is_empty());
    }

    #[test]
    fn writes_are_fifo_and_bounded() {
        let mut s = ValueStore::new(2);
        let v = s.add_variable("/v", var(0)).unwrap();
        let w1 = s.update_target_value(v, Value::UInt(1), 10).unwrap();
        let w2 = s.update_target_value(v, Value::UInt(2), 11).unwrap();
        assert_eq!(
            s.update_target_value(v, Value::UInt(3), 12),
            Err(StoreError::WriteQueueFull(v))
        );
        assert_eq!(s.active_write(v).unwrap().id, w1);
        let o = s.complete_active_write(v, Ok(()), 20).unwrap();
        assert!(o.success);
        assert_eq!(o.created_us, 10);
        assert_eq!(s.active_write(v).unwrap().id, w2);
    }

    #[test]
    fn alias_write_completes_with_target() {
        let mut s = ValueStore::default();
        let v = s.add_variable("/v", var(0)).unwrap();
        let a = s
            .add_alias("/a", AliasDef::new(v).with_gain(10.0).with_limits(0.0, 100.0))
            .unwrap();
        let aw = s.update_target_value(a, Value::Float(500.0), 0).unwrap();
        assert_eq!(s.entries_with_pending_writes(), vec![v]);

        let target = *s.active_write(v).unwrap();
        assert_eq!(target.value, Value::Float(10.0));
        assert_eq!(s.active_write(a).unwrap().linked, Some(target.id));

        s.complete_active_write(v, Err("device said no".into()), 5);
        let outcomes = s.take_write_outcomes();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[1].write, aw);
        assert!(!outcomes[1].success);
        assert_eq!(outcomes[1].reason.as_deref(), Some("device said no"));
        assert_eq!(s.pending_write_count(a), 0);
    }

    #[test]
    fn clear_fails_pending_writes() {
        let mut s = ValueStore::default();
        let v = s.add_variable("/v", var(0)).unwrap();
        s.update_target_value(v, Value::UInt(1), 0).unwrap();
        s.clear(3);
        let outcomes = s.take_write_outcomes();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].success);
        assert!(s.is_empty());
        assert!(s.find("/v").is_none());
    }

    #[test]
    fn undrained_write_outcomes_keep_the_newest() {
        use crate::dispatch::OUTCOME_QUEUE_DEPTH;

        let mut s = ValueStore::default();
        let v = s.add_variable("/v", var(0)).unwrap();
        let mut last = None;
        for i in 0..OUTCOME_QUEUE_DEPTH + 5 {
            last = Some(s.update_target_value(v, Value::UInt(i as u64), 0).unwrap());
            s.complete_active_write(v, Ok(()), 1);
        }
        let outcomes = s.take_write_outcomes();
        assert_eq!(outcomes.len(), OUTCOME_QUEUE_DEPTH);
        assert_eq!(outcomes[0].value, Value::UInt(5));
        assert_eq!(outcomes.last().map(|o| o.write), last);
    }

    #[test]
    fn aliases_cannot_be_set_from_device() {
        let mut s = ValueStore::default();
        let v = s.add_variable("/v", var(0)).unwrap();
        let a = s.add_alias("/a", AliasDef::new(v)).unwrap();
        assert_eq!(s.set_value(a, Value::UInt(1)), Err(StoreError::NotWritable(a)));
    }
}
