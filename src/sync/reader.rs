//! Read scheduler.
//!
//! A three-way round robin over {watched variables, watched RPVs, raw
//! reads}.  Every emitted request belongs to exactly one category; the
//! reader moves to the next category when the current one wraps its
//! cursor or has nothing eligible, so no category can starve another.
//!
//! ```text
//!   Variable ──wrap──▶ Rpv ──wrap──▶ Raw ──chunk──▶ Variable ...
//! ```
//!
//! Variables are visited in address order from a cursor that persists
//! across ticks.  Each candidate is added to a span-only
//! [`ByteRangeStore`] so nearby variables merge into few blocks; the
//! batch stops before the block count exceeds what the request payload
//! can carry or the projected response outgrows the response payload.

use std::collections::{HashMap, VecDeque};

use log::{debug, trace, warn};

use crate::datastore::{Entry, EntryId, ValueStore};
use crate::dispatch::{Completion, Dispatcher, Origin, OutcomeQueue, PRIORITY_READ};
use crate::error::Error;
use crate::memory::ByteRangeStore;
use crate::protocol::{BlockHeader, EmbeddedDataType, MemoryBlock, ProtocolCodec, Request, ResponseData, RpvValue};

use super::{DeviceModel, RawReadOutcome, RawRequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCategory {
    Variable,
    Rpv,
    Raw,
}

impl ReadCategory {
    fn next(self) -> Self {
        match self {
            Self::Variable => Self::Rpv,
            Self::Rpv => Self::Raw,
            Self::Raw => Self::Variable,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub variable_reads: u64,
    pub rpv_reads: u64,
    pub raw_chunks: u64,
    /// Responses discarded (non-OK, malformed, or dispatch failure).
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy)]
struct WatchedVariable {
    id: EntryId,
    address: u64,
    size: usize,
    has_codec: bool,
}

#[derive(Debug, Clone, Copy)]
struct WatchedRpv {
    id: EntryId,
    rpv: u16,
    dtype: EmbeddedDataType,
}

enum InFlightRead {
    Variables(Vec<EntryId>),
    Rpvs(Vec<EntryId>),
    Raw,
}

struct Batch {
    request: Request,
    read: InFlightRead,
    /// The cursor passed the end of its list: switch category.
    wrapped: bool,
}

struct RawRead {
    id: RawRequestId,
    address: u64,
    size: usize,
    data: Vec<u8>,
}

pub struct MemoryReader {
    category: ReadCategory,
    in_flight: Option<InFlightRead>,
    variables: Vec<WatchedVariable>,
    rpvs: Vec<WatchedRpv>,
    var_cursor: usize,
    rpv_cursor: usize,
    generation: Option<u64>,
    raw_queue: VecDeque<RawRead>,
    raw_queue_depth: usize,
    max_raw_size: usize,
    raw_outcomes: OutcomeQueue<RawReadOutcome>,
    next_raw: u64,
    stats: ReaderStats,
}

impl MemoryReader {
    /// `max_raw_size` bounds a single raw read; larger requests are
    /// refused up front.
    pub fn new(raw_queue_depth: usize, max_raw_size: usize) -> Self {
        Self {
            category: ReadCategory::Variable,
            in_flight: None,
            variables: Vec::new(),
            rpvs: Vec::new(),
            var_cursor: 0,
            rpv_cursor: 0,
            generation: None,
            raw_queue: VecDeque::new(),
            raw_queue_depth: raw_queue_depth.max(1),
            max_raw_size,
            raw_outcomes: OutcomeQueue::new("raw read"),
            next_raw: 0,
            stats: ReaderStats::default(),
        }
    }

    /// Category the next request will be taken from.
    pub fn category(&self) -> ReadCategory {
        self.category
    }

    /// True while a read is outstanding.
    pub fn is_pending(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    // ── Watched set ───────────────────────────────────────────

    fn refresh(&mut self, store: &ValueStore) {
        let generation = store.watch_generation();
        if self.generation == Some(generation) {
            return;
        }
        self.generation = Some(generation);

        self.variables = store
            .watched_variables()
            .into_iter()
            .filter_map(|id| {
                let def = store.get_entry(id)?.as_variable()?;
                Some(WatchedVariable {
                    id,
                    address: def.address,
                    size: def.size(),
                    has_codec: def.dtype.has_codec(),
                })
            })
            .collect();
        self.variables.sort_by_key(|v| (v.address, v.id));

        self.rpvs = store
            .watched_rpvs()
            .into_iter()
            .filter_map(|id| {
                let def = store.get_entry(id)?.as_rpv()?;
                Some(WatchedRpv {
                    id,
                    rpv: def.id,
                    dtype: def.dtype,
                })
            })
            .collect();
        self.rpvs.sort_by_key(|r| (r.rpv, r.id));

        if self.var_cursor >= self.variables.len() {
            self.var_cursor = 0;
        }
        if self.rpv_cursor >= self.rpvs.len() {
            self.rpv_cursor = 0;
        }
        debug!(
            "Reader: watching {} variables, {} RPVs",
            self.variables.len(),
            self.rpvs.len()
        );
    }

    // ── Tick ──────────────────────────────────────────────────

    /// Emit at most one read request.
    pub fn process(&mut self, model: &DeviceModel, store: &ValueStore, dispatcher: &mut Dispatcher) {
        if self.in_flight.is_some() {
            return;
        }
        self.refresh(store);

        for _ in 0..3 {
            let batch = match self.category {
                ReadCategory::Variable => self.next_variable_batch(model),
                ReadCategory::Rpv => self.next_rpv_batch(model),
                ReadCategory::Raw => self.next_raw_chunk(model),
            };
            let Some(batch) = batch else {
                self.category = self.category.next();
                continue;
            };
            trace!("Reader: {:?} request, {} bytes", self.category, batch.request.payload.len());
            if batch.wrapped {
                self.category = self.category.next();
            }
            dispatcher.register(batch.request, Origin::Reader, PRIORITY_READ);
            self.in_flight = Some(batch.read);
            return;
        }
    }

    fn variable_is_readable(v: &WatchedVariable, model: &DeviceModel) -> bool {
        let codec = &model.codec;
        v.has_codec
            && v.size <= u16::MAX as usize
            && codec.address_size().covers(v.address, v.size)
            && v.size + codec.read_response_block_overhead() <= model.max_response_payload()
            && codec.read_request_block_size() <= model.max_request_payload()
            && !model.regions.is_forbidden(v.address, v.size as u64)
    }

    fn next_variable_batch(&mut self, model: &DeviceModel) -> Option<Batch> {
        let n = self.variables.len();
        let codec = &model.codec;
        let overhead = codec.read_response_block_overhead();
        let max_blocks = model.max_request_payload() / codec.read_request_block_size();
        let max_response = model.max_response_payload();

        let mut planner = ByteRangeStore::without_data();
        let mut batch = Vec::new();
        let mut skipped = 0;
        let mut wrapped = false;

        while batch.len() + skipped < n {
            if self.var_cursor >= n {
                self.var_cursor = 0;
                wrapped = true;
            }
            let v = self.variables[self.var_cursor];
            if !Self::variable_is_readable(&v, model) {
                skipped += 1;
                self.var_cursor += 1;
                continue;
            }
            let mut candidate = planner.clone();
            if candidate.add_empty(v.address, v.size).is_err() {
                skipped += 1;
                self.var_cursor += 1;
                continue;
            }
            let blocks = candidate.block_count();
            if blocks > max_blocks || blocks * overhead + candidate.total_len() > max_response {
                break;
            }
            planner = candidate;
            batch.push(v.id);
            self.var_cursor += 1;
        }
        if self.var_cursor >= n {
            self.var_cursor = 0;
            wrapped = true;
        }
        if batch.is_empty() {
            return None;
        }

        let blocks: Vec<BlockHeader> = planner
            .ranges()
            .map(|r| BlockHeader {
                address: r.start,
                len: r.len as u16,
            })
            .collect();
        match codec.read_memory_request(&blocks) {
            Ok(request) => {
                self.stats.variable_reads += 1;
                Some(Batch {
                    request,
                    read: InFlightRead::Variables(batch),
                    wrapped,
                })
            }
            Err(e) => {
                warn!("Reader: cannot build variable read: {}", e);
                None
            }
        }
    }

    fn next_rpv_batch(&mut self, model: &DeviceModel) -> Option<Batch> {
        let n = self.rpvs.len();
        let max_request = model.max_request_payload();
        let max_response = model.max_response_payload();

        let mut request_size = 0;
        let mut response_size = 0;
        let mut batch = Vec::new();
        let mut ids = Vec::new();
        let mut skipped = 0;
        let mut wrapped = false;

        while batch.len() + skipped < n {
            if self.rpv_cursor >= n {
                self.rpv_cursor = 0;
                wrapped = true;
            }
            let r = self.rpvs[self.rpv_cursor];
            let response_cost = ProtocolCodec::rpv_response_size(r.dtype);
            let eligible = r.dtype.has_codec()
                && model.codec.rpv_type(r.rpv).is_some()
                && response_cost <= max_response
                && ProtocolCodec::RPV_REQUEST_SIZE_PER_ID <= max_request;
            if !eligible {
                skipped += 1;
                self.rpv_cursor += 1;
                continue;
            }
            if request_size + ProtocolCodec::RPV_REQUEST_SIZE_PER_ID > max_request
                || response_size + response_cost > max_response
            {
                break;
            }
            request_size += ProtocolCodec::RPV_REQUEST_SIZE_PER_ID;
            response_size += response_cost;
            batch.push(r.id);
            ids.push(r.rpv);
            self.rpv_cursor += 1;
        }
        if self.rpv_cursor >= n {
            self.rpv_cursor = 0;
            wrapped = true;
        }
        if batch.is_empty() {
            return None;
        }

        match model.codec.read_rpv_request(&ids) {
            Ok(request) => {
                self.stats.rpv_reads += 1;
                Some(Batch {
                    request,
                    read: InFlightRead::Rpvs(batch),
                    wrapped,
                })
            }
            Err(e) => {
                warn!("Reader: cannot build RPV read: {}", e);
                None
            }
        }
    }

    fn next_raw_chunk(&mut self, model: &DeviceModel) -> Option<Batch> {
        let codec = &model.codec;
        let raw = self.raw_queue.front()?;
        let max_chunk = model
            .max_response_payload()
            .saturating_sub(codec.read_response_block_overhead())
            .min(u16::MAX as usize);
        let chunk = (raw.size - raw.data.len()).min(max_chunk);
        let address = raw.address + raw.data.len() as u64;

        let request = if chunk == 0 || codec.read_request_block_size() > model.max_request_payload() {
            Err("link payload too small for a memory read".to_string())
        } else {
            codec
                .read_memory_request(&[BlockHeader {
                    address,
                    len: chunk as u16,
                }])
                .map_err(|e| e.to_string())
        };

        match request {
            Ok(request) => Some(Batch {
                request,
                read: InFlightRead::Raw,
                wrapped: true,
            }),
            Err(reason) => {
                self.finish_raw(Err(reason));
                None
            }
        }
    }

    // ── Completion ────────────────────────────────────────────

    /// Apply the outcome of the outstanding read.
    pub fn handle_completion(&mut self, completion: Completion, model: &DeviceModel, store: &mut ValueStore) {
        let Some(read) = self.in_flight.take() else {
            debug!("Reader: completion with nothing in flight");
            return;
        };
        let response = match completion.outcome {
            Ok(resp) => model
                .codec
                .parse_response(&completion.request, &resp)
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match (read, response) {
            (InFlightRead::Variables(ids), Ok(ResponseData::ReadMemory(blocks))) => {
                Self::apply_variables(&ids, &blocks, store);
            }
            (InFlightRead::Rpvs(ids), Ok(ResponseData::ReadRpv(values))) => {
                Self::apply_rpvs(&ids, &values, store);
            }
            (InFlightRead::Raw, response) => self.advance_raw(response),
            (_, Ok(other)) => {
                warn!("Reader: unexpected response {:?}", other);
                self.stats.dropped += 1;
            }
            (_, Err(reason)) => {
                warn!("Reader: read dropped: {}", reason);
                self.stats.dropped += 1;
            }
        }
    }

    fn apply_variables(ids: &[EntryId], blocks: &[MemoryBlock], store: &mut ValueStore) {
        let mut buffer = ByteRangeStore::with_data();
        for b in blocks {
            if let Err(e) = buffer.write(b.address, &b.data) {
                warn!("Reader: block at 0x{:X} discarded: {}", b.address, e);
            }
        }
        for &id in ids {
            let Some(def) = store.get_entry(id).and_then(Entry::as_variable) else {
                continue;
            };
            let value = buffer
                .read(def.address, def.size())
                .map_err(Error::from)
                .and_then(|bytes| def.decode(bytes).map_err(Error::from));
            match value {
                Ok(v) => {
                    if let Err(e) = store.set_value(id, v) {
                        warn!("Reader: cannot update {}: {}", id, e);
                    }
                }
                Err(e) => warn!("Reader: cannot decode {}: {}", id, e),
            }
        }
    }

    fn apply_rpvs(ids: &[EntryId], values: &[RpvValue], store: &mut ValueStore) {
        let by_id: HashMap<u16, _> = values.iter().map(|v| (v.id, v.value)).collect();
        for &id in ids {
            let Some(rpv) = store.get_entry(id).and_then(Entry::as_rpv).map(|r| r.id) else {
                continue;
            };
            match by_id.get(&rpv) {
                Some(value) => {
                    if let Err(e) = store.set_value(id, *value) {
                        warn!("Reader: cannot update {}: {}", id, e);
                    }
                }
                None => warn!("Reader: RPV 0x{:04X} missing from response", rpv),
            }
        }
    }

    // ── Raw reads ─────────────────────────────────────────────

    /// Queue an ad hoc read of `size` bytes at `address`.  Invalid
    /// requests fail at once, without touching the link.
    pub fn request_raw_read(&mut self, address: u64, size: usize, model: &DeviceModel) -> RawRequestId {
        let id = RawRequestId(self.next_raw);
        self.next_raw += 1;

        let rejection = self.check_raw(address, size, model).or_else(|| {
            (self.raw_queue.len() >= self.raw_queue_depth).then_some("raw read queue full")
        });

        if let Some(reason) = rejection {
            warn!("Reader: raw read of {} bytes at 0x{:X} refused: {}", size, address, reason);
            self.raw_outcomes.push(RawReadOutcome {
                id,
                address,
                result: Err(reason.into()),
            });
        } else {
            self.raw_queue.push_back(RawRead {
                id,
                address,
                size,
                data: Vec::new(),
            });
        }
        id
    }

    fn check_raw(&self, address: u64, size: usize, model: &DeviceModel) -> Option<&'static str> {
        if size == 0 {
            Some("zero-length read")
        } else if size > self.max_raw_size {
            Some("read larger than the raw read limit")
        } else if !model.codec.address_size().covers(address, size) {
            Some("address range exceeds device address space")
        } else if model.regions.is_forbidden(address, size as u64) {
            Some("range touches a forbidden region")
        } else {
            None
        }
    }

    fn advance_raw(&mut self, response: Result<ResponseData, String>) {
        let chunk = match response {
            Ok(ResponseData::ReadMemory(mut blocks)) if blocks.len() == 1 => blocks.remove(0).data,
            Ok(_) => {
                self.finish_raw(Err("unexpected response to raw read".into()));
                return;
            }
            Err(reason) => {
                self.finish_raw(Err(reason));
                return;
            }
        };
        self.stats.raw_chunks += 1;
        let Some(raw) = self.raw_queue.front_mut() else {
            return;
        };
        raw.data.extend_from_slice(&chunk);
        if raw.data.len() >= raw.size {
            let data = core::mem::take(&mut raw.data);
            self.finish_raw(Ok(data));
        }
    }

    fn finish_raw(&mut self, result: Result<Vec<u8>, String>) {
        if let Some(raw) = self.raw_queue.pop_front() {
            if let Err(reason) = &result {
                warn!("Reader: raw read at 0x{:X} failed: {}", raw.address, reason);
            }
            self.raw_outcomes.push(RawReadOutcome {
                id: raw.id,
                address: raw.address,
                result,
            });
        }
    }

    /// Drain finished raw reads, oldest first.
    pub fn take_raw_read_outcomes(&mut self) -> Vec<RawReadOutcome> {
        self.raw_outcomes.drain()
    }

    pub fn raw_reads_queued(&self) -> usize {
        self.raw_queue.len()
    }

    /// The device description changed.  Cursors restart and queued raw
    /// reads that no longer fit the device fail.  An outstanding read
    /// stays outstanding until its completion arrives.
    pub fn reconfigure(&mut self, model: &DeviceModel) {
        self.category = ReadCategory::Variable;
        self.var_cursor = 0;
        self.rpv_cursor = 0;
        self.generation = None;

        // The head raw read may already be on the wire or half read.
        let started = usize::from(
            self.raw_queue
                .front()
                .is_some_and(|r| !r.data.is_empty() || matches!(self.in_flight, Some(InFlightRead::Raw))),
        );
        let mut kept = VecDeque::with_capacity(self.raw_queue.len());
        for (i, raw) in core::mem::take(&mut self.raw_queue).into_iter().enumerate() {
            match self.check_raw(raw.address, raw.size, model) {
                Some(reason) if i >= started => {
                    warn!("Reader: raw read at 0x{:X} failed: {}", raw.address, reason);
                    self.raw_outcomes.push(RawReadOutcome {
                        id: raw.id,
                        address: raw.address,
                        result: Err(reason.into()),
                    });
                }
                _ => kept.push_back(raw),
            }
        }
        self.raw_queue = kept;
    }

    /// Forget all progress after the link was torn down.  Queued raw
    /// reads fail.
    pub fn reset(&mut self) {
        self.in_flight = None;
        self.category = ReadCategory::Variable;
        self.var_cursor = 0;
        self.rpv_cursor = 0;
        self.generation = None;
        while !self.raw_queue.is_empty() {
            self.finish_raw(Err("link reset".into()));
        }
    }
}
