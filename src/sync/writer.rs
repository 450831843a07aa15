//! Write scheduler.
//!
//! Takes the active write of each entry with queued writes in turn
//! (round robin by entry id, FIFO within an entry) and alternates those
//! with chunks of raw writes.  A write is only applied to the store once
//! the device has acknowledged exactly what was sent.

use std::collections::VecDeque;

use log::{debug, trace, warn};

use crate::datastore::{EncodedWrite, EntryId, EntryKind, ValueStore, WriteId};
use crate::dispatch::{Completion, Dispatcher, Origin, OutcomeQueue, PRIORITY_WRITE};
use crate::protocol::{
    BlockHeader, Endianness, MaskedBlock, MemoryBlock, Request, ResponseData, RpvValue, Value,
    decode_value, encode_value,
};

use super::{DeviceModel, RawRequestId, RawWriteOutcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub variable_writes: u64,
    pub rpv_writes: u64,
    pub raw_chunks: u64,
    pub failed: u64,
}

/// What the device must acknowledge for a write to count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExpectedAck {
    Block { address: u64, len: u16 },
    Rpv { id: u16, size: u8 },
}

enum InFlightWrite {
    Entry {
        id: EntryId,
        write: WriteId,
        /// Value the device holds once the write lands.
        effective: Value,
        ack: ExpectedAck,
    },
    Raw {
        ack: ExpectedAck,
    },
}

struct RawWrite {
    id: RawRequestId,
    address: u64,
    data: Vec<u8>,
    written: usize,
}

pub struct MemoryWriter {
    in_flight: Option<InFlightWrite>,
    last_entry: Option<EntryId>,
    raw_turn: bool,
    raw_queue: VecDeque<RawWrite>,
    raw_queue_depth: usize,
    raw_outcomes: OutcomeQueue<RawWriteOutcome>,
    next_raw: u64,
    stats: WriterStats,
}

impl MemoryWriter {
    pub fn new(raw_queue_depth: usize) -> Self {
        Self {
            in_flight: None,
            last_entry: None,
            raw_turn: false,
            raw_queue: VecDeque::new(),
            raw_queue_depth: raw_queue_depth.max(1),
            raw_outcomes: OutcomeQueue::new("raw write"),
            next_raw: 0,
            stats: WriterStats::default(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    // ── Tick ──────────────────────────────────────────────────

    /// Emit at most one write request.  Writes that can never succeed
    /// (protected region, unencodable value) fail here without traffic.
    pub fn process(&mut self, model: &DeviceModel, store: &mut ValueStore, dispatcher: &mut Dispatcher, now_us: u64) {
        if self.in_flight.is_some() {
            return;
        }
        let raw_first = self.raw_turn;
        for attempt in 0..2 {
            let raw = raw_first != (attempt == 1);
            let sent = if raw {
                self.next_raw_chunk(model, dispatcher)
            } else {
                self.next_entry_write(model, store, dispatcher, now_us)
            };
            if sent {
                self.raw_turn = !raw;
                return;
            }
        }
    }

    fn next_entry_write(
        &mut self,
        model: &DeviceModel,
        store: &mut ValueStore,
        dispatcher: &mut Dispatcher,
        now_us: u64,
    ) -> bool {
        let pending = store.entries_with_pending_writes();
        if pending.is_empty() {
            return false;
        }
        let start = self
            .last_entry
            .and_then(|last| pending.iter().position(|id| *id > last))
            .unwrap_or(0);

        for i in 0..pending.len() {
            let id = pending[(start + i) % pending.len()];
            self.last_entry = Some(id);
            let Some(write) = store.active_write(id).copied() else {
                continue;
            };
            match Self::build_entry_write(id, write.value, model, store) {
                Ok((request, effective, ack)) => {
                    trace!("Writer: {} <- {} ({})", id, effective, write.id);
                    dispatcher.register(request, Origin::Writer, PRIORITY_WRITE);
                    self.in_flight = Some(InFlightWrite::Entry {
                        id,
                        write: write.id,
                        effective,
                        ack,
                    });
                    return true;
                }
                Err(reason) => {
                    warn!("Writer: write to {} refused: {}", id, reason);
                    self.stats.failed += 1;
                    store.complete_active_write(id, Err(reason), now_us);
                }
            }
        }
        false
    }

    fn build_entry_write(
        id: EntryId,
        value: Value,
        model: &DeviceModel,
        store: &ValueStore,
    ) -> Result<(Request, Value, ExpectedAck), String> {
        let codec = &model.codec;
        let entry = store.get_entry(id).ok_or("entry no longer exists")?;
        let (request, effective, ack) = match entry.kind() {
            EntryKind::Variable(def) => {
                let size = def.size();
                if !codec.address_size().covers(def.address, size) {
                    return Err("address exceeds device address space".into());
                }
                if !model.regions.is_writable(def.address, size as u64) {
                    return Err("variable lies in a protected region".into());
                }
                let encoded = def.encode(value).map_err(|e| e.to_string())?;
                let (request, effective) = match encoded {
                    EncodedWrite::Plain(data) => {
                        let effective = def.decode(&data).map_err(|e| e.to_string())?;
                        let block = MemoryBlock {
                            address: def.address,
                            data,
                        };
                        (codec.write_memory_request(&[block]), effective)
                    }
                    EncodedWrite::Masked { data, mask } => {
                        let effective = def.decode(&data).map_err(|e| e.to_string())?;
                        let block = MaskedBlock {
                            address: def.address,
                            data,
                            mask,
                        };
                        (codec.write_memory_masked_request(&[block]), effective)
                    }
                };
                let len = u16::try_from(size).map_err(|_| "variable too large to write")?;
                let request = request.map_err(|e| e.to_string())?;
                (request, effective, ExpectedAck::Block { address: def.address, len })
            }
            EntryKind::Rpv(def) => {
                if codec.rpv_type(def.id).is_none() {
                    return Err(format!("RPV 0x{:04X} unknown to device", def.id));
                }
                let bytes = encode_value(def.dtype, Endianness::Big, value).map_err(|e| e.to_string())?;
                let effective = decode_value(def.dtype, Endianness::Big, &bytes).map_err(|e| e.to_string())?;
                let request = codec
                    .write_rpv_request(&[RpvValue {
                        id: def.id,
                        value: effective,
                    }])
                    .map_err(|e| e.to_string())?;
                let size = u8::try_from(bytes.len()).map_err(|_| "RPV too large to write")?;
                (request, effective, ExpectedAck::Rpv { id: def.id, size })
            }
            EntryKind::Alias(_) => return Err("aliases are written through their target".into()),
        };
        if request.payload.len() > model.max_request_payload() {
            return Err("write exceeds device request size".into());
        }
        Ok((request, effective, ack))
    }

    fn next_raw_chunk(&mut self, model: &DeviceModel, dispatcher: &mut Dispatcher) -> bool {
        let codec = &model.codec;
        let Some(raw) = self.raw_queue.front() else {
            return false;
        };
        let max_chunk = model
            .max_request_payload()
            .saturating_sub(codec.write_request_block_size(0, false))
            .min(u16::MAX as usize);
        let chunk = (raw.data.len() - raw.written).min(max_chunk);
        let address = raw.address + raw.written as u64;

        let request = if chunk == 0 {
            Err("link payload too small for a memory write".to_string())
        } else {
            codec
                .write_memory_request(&[MemoryBlock {
                    address,
                    data: raw.data[raw.written..raw.written + chunk].to_vec(),
                }])
                .map_err(|e| e.to_string())
        };

        match request {
            Ok(request) => {
                dispatcher.register(request, Origin::Writer, PRIORITY_WRITE);
                self.in_flight = Some(InFlightWrite::Raw {
                    ack: ExpectedAck::Block {
                        address,
                        len: chunk as u16,
                    },
                });
                true
            }
            Err(reason) => {
                self.finish_raw(Err(reason));
                false
            }
        }
    }

    // ── Completion ────────────────────────────────────────────

    /// Apply the outcome of the outstanding write.
    pub fn handle_completion(&mut self, completion: Completion, model: &DeviceModel, store: &mut ValueStore, now_us: u64) {
        let Some(write) = self.in_flight.take() else {
            debug!("Writer: completion with nothing in flight");
            return;
        };
        let response = match completion.outcome {
            Ok(resp) => model
                .codec
                .parse_response(&completion.request, &resp)
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match write {
            InFlightWrite::Entry {
                id,
                write,
                effective,
                ack,
            } => {
                if store.active_write(id).map(|w| w.id) != Some(write) {
                    debug!("Writer: {} for {} no longer active", write, id);
                    return;
                }
                let result = response.and_then(|data| Self::verify_ack(&data, ack));
                match &result {
                    Ok(()) => {
                        match ack {
                            ExpectedAck::Block { .. } => self.stats.variable_writes += 1,
                            ExpectedAck::Rpv { .. } => self.stats.rpv_writes += 1,
                        }
                        if let Err(e) = store.set_value(id, effective) {
                            warn!("Writer: cannot update {}: {}", id, e);
                        }
                    }
                    Err(reason) => {
                        warn!("Writer: write to {} failed: {}", id, reason);
                        self.stats.failed += 1;
                    }
                }
                store.complete_active_write(id, result, now_us);
            }
            InFlightWrite::Raw { ack } => match response.and_then(|data| Self::verify_ack(&data, ack)) {
                Ok(()) => {
                    self.stats.raw_chunks += 1;
                    let Some(raw) = self.raw_queue.front_mut() else {
                        return;
                    };
                    if let ExpectedAck::Block { len, .. } = ack {
                        raw.written += usize::from(len);
                    }
                    if raw.written >= raw.data.len() {
                        self.finish_raw(Ok(()));
                    }
                }
                Err(reason) => {
                    self.stats.failed += 1;
                    self.finish_raw(Err(reason));
                }
            },
        }
    }

    fn verify_ack(data: &ResponseData, expected: ExpectedAck) -> Result<(), String> {
        let matches = match (data, expected) {
            (
                ResponseData::WriteMemory(acks) | ResponseData::WriteMemoryMasked(acks),
                ExpectedAck::Block { address, len },
            ) => acks.as_slice() == [BlockHeader { address, len }],
            (ResponseData::WriteRpv(acks), ExpectedAck::Rpv { id, size }) => {
                acks.len() == 1 && acks[0].id == id && acks[0].size == size
            }
            _ => false,
        };
        if matches {
            Ok(())
        } else {
            Err("device acknowledged something other than what was written".into())
        }
    }

    // ── Raw writes ────────────────────────────────────────────

    /// Queue an ad hoc write of `data` at `address`.  Invalid requests
    /// fail at once, without touching the link.
    pub fn request_raw_write(&mut self, address: u64, data: Vec<u8>, model: &DeviceModel) -> RawRequestId {
        let id = RawRequestId(self.next_raw);
        self.next_raw += 1;

        let rejection = if data.is_empty() {
            Some("zero-length write")
        } else if !model.codec.address_size().covers(address, data.len()) {
            Some("address range exceeds device address space")
        } else if !model.regions.is_writable(address, data.len() as u64) {
            Some("range touches a protected region")
        } else if self.raw_queue.len() >= self.raw_queue_depth {
            Some("raw write queue full")
        } else {
            None
        };

        if let Some(reason) = rejection {
            warn!("Writer: raw write of {} bytes at 0x{:X} refused: {}", data.len(), address, reason);
            self.raw_outcomes.push(RawWriteOutcome {
                id,
                address,
                result: Err(reason.into()),
            });
        } else {
            self.raw_queue.push_back(RawWrite {
                id,
                address,
                data,
                written: 0,
            });
        }
        id
    }

    fn finish_raw(&mut self, result: Result<(), String>) {
        if let Some(raw) = self.raw_queue.pop_front() {
            if let Err(reason) = &result {
                warn!("Writer: raw write at 0x{:X} failed: {}", raw.address, reason);
            }
            self.raw_outcomes.push(RawWriteOutcome {
                id: raw.id,
                address: raw.address,
                result,
            });
        }
    }

    /// Drain finished raw writes, oldest first.
    pub fn take_raw_write_outcomes(&mut self) -> Vec<RawWriteOutcome> {
        self.raw_outcomes.drain()
    }

    pub fn raw_writes_queued(&self) -> usize {
        self.raw_queue.len()
    }

    /// Forget the in-flight write after the link was torn down.  Queued
    /// raw writes fail; entry writes are failed by the store.
    pub fn reset(&mut self) {
        self.in_flight = None;
        self.last_entry = None;
        self.raw_turn = false;
        while !self.raw_queue.is_empty() {
            self.finish_raw(Err("link reset".into()));
        }
    }
}
