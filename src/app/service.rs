//! Synchronization service: the hexagonal core.
//!
//! [`SyncService`] owns the value store, the request dispatcher and both
//! schedulers.  One call to [`process`](SyncService::process) is one
//! tick: collect at most the completions that are ready, route each to
//! its submitter, then let the writer and the reader emit their next
//! request.  All I/O flows through the [`Link`] and [`Clock`] ports.
//!
//! ```text
//!   Link ◀──▶ ┌──────────────────────────────────────┐
//!             │              SyncService              │
//!   Clock ──▶ │ Dispatcher · MemoryWriter · MemoryReader │ ◀──▶ ValueStore
//!             └──────────────────────────────────────┘
//! ```

use log::{debug, info, warn};

use crate::config::SyncConfig;
use crate::datastore::ValueStore;
use crate::dispatch::{Completion, DispatchStats, Dispatcher, Origin, OutcomeQueue, PRIORITY_CONTROL};
use crate::error::{Error, Result};
use crate::memory::RegionMap;
use crate::protocol::{DeviceParams, Request, ResponseData, RpvDefinition};
use crate::sync::{DeviceModel, MemoryReader, MemoryWriter, RawReadOutcome, RawRequestId, RawWriteOutcome};

use super::ports::{Clock, Link};

/// Result of a control-plane request submitted through
/// [`SyncService::submit_control`].
#[derive(Debug, Clone, PartialEq)]
pub struct ControlOutcome {
    pub ticket: u32,
    pub request: Request,
    pub result: core::result::Result<ResponseData, Error>,
}

// ───────────────────────────────────────────────────────────────
// SyncService
// ───────────────────────────────────────────────────────────────

pub struct SyncService<L: Link, C: Clock> {
    link: L,
    clock: C,
    model: DeviceModel,
    store: ValueStore,
    dispatcher: Dispatcher,
    reader: MemoryReader,
    writer: MemoryWriter,
    control_outcomes: OutcomeQueue<ControlOutcome>,
    next_ticket: u32,
    tick_count: u64,
}

impl<L: Link, C: Clock> SyncService<L, C> {
    /// Build the service.  The device is assumed to match
    /// `config.device` and `config.regions` until
    /// [`configure_device`](Self::configure_device) says otherwise.
    pub fn new(config: &SyncConfig, link: L, clock: C) -> Result<Self> {
        config.validate()?;
        let model = DeviceModel::new(config.device, config.regions.clone());
        let dispatcher = Dispatcher::new(config.request_timeout_us, model.max_response_payload());
        info!(
            "SyncService: timeout={}us write_depth={} raw_depth={}",
            config.request_timeout_us, config.write_queue_depth, config.raw_queue_depth
        );
        Ok(Self {
            link,
            clock,
            model,
            store: ValueStore::new(config.write_queue_depth),
            dispatcher,
            reader: MemoryReader::new(config.raw_queue_depth, config.max_raw_read_size),
            writer: MemoryWriter::new(config.raw_queue_depth),
            control_outcomes: OutcomeQueue::new("control"),
            next_ticket: 0,
            tick_count: 0,
        })
    }

    // ── Device description ────────────────────────────────────

    /// Adopt the parameters and protected regions reported by the
    /// device.  Read cursors restart from the beginning; requests
    /// already handed to the dispatcher complete as usual.
    pub fn configure_device(&mut self, params: DeviceParams, regions: RegionMap) {
        info!(
            "SyncService: device rx={} tx={} address={}B forbidden={} readonly={}",
            params.max_rx_data_size,
            params.max_tx_data_size,
            params.address_size.bytes(),
            regions.forbidden.len(),
            regions.readonly.len()
        );
        self.model.params = params;
        self.model.codec.set_address_size(params.address_size);
        self.model.regions = regions;
        self.dispatcher.set_max_response_payload(self.model.max_response_payload());
        self.reader.reconfigure(&self.model);
    }

    /// Register the RPV id → type map reported by the device.
    pub fn set_rpv_definitions(&mut self, defs: impl IntoIterator<Item = RpvDefinition>) {
        self.model.codec.set_rpv_definitions(defs);
    }

    pub fn device(&self) -> &DeviceModel {
        &self.model
    }

    // ── Store access ──────────────────────────────────────────

    pub fn store(&self) -> &ValueStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ValueStore {
        &mut self.store
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    // ── Per-tick orchestration ────────────────────────────────

    /// Run one tick.  Never blocks.
    pub fn process(&mut self) {
        self.tick_count += 1;
        let now = self.clock.now_us();

        while let Some(completion) = self.dispatcher.process(&mut self.link, now) {
            self.route(completion, now);
        }

        if !self.link.is_up() {
            return;
        }
        self.writer
            .process(&self.model, &mut self.store, &mut self.dispatcher, now);
        self.reader.process(&self.model, &self.store, &mut self.dispatcher);

        // Send what the schedulers just queued without waiting a tick.
        if !self.dispatcher.has_in_flight() {
            while let Some(completion) = self.dispatcher.process(&mut self.link, now) {
                self.route(completion, now);
            }
        }
    }

    fn route(&mut self, completion: Completion, now: u64) {
        match completion.origin {
            Origin::Reader => self
                .reader
                .handle_completion(completion, &self.model, &mut self.store),
            Origin::Writer => self
                .writer
                .handle_completion(completion, &self.model, &mut self.store, now),
            Origin::Control(ticket) => {
                let result = match completion.outcome {
                    Ok(response) => self
                        .model
                        .codec
                        .parse_response(&completion.request, &response)
                        .map_err(Error::from),
                    Err(e) => Err(Error::from(e)),
                };
                if let Err(e) = &result {
                    warn!("SyncService: control request {} failed: {}", ticket, e);
                }
                self.control_outcomes.push(ControlOutcome {
                    ticket,
                    request: completion.request,
                    result,
                });
            }
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    // ── Control plane ─────────────────────────────────────────

    /// Queue a control request ahead of all reads and writes.  The
    /// answer is delivered through [`take_control_outcomes`](Self::take_control_outcomes)
    /// under the returned ticket.
    pub fn submit_control(&mut self, request: Request) -> u32 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.dispatcher
            .register(request, Origin::Control(ticket), PRIORITY_CONTROL);
        ticket
    }

    /// Queue a heartbeat carrying `challenge`.
    pub fn heartbeat(&mut self, session_id: u32, challenge: u16) -> u32 {
        let request = self.model.codec.comm_heartbeat(session_id, challenge);
        self.submit_control(request)
    }

    /// Drain finished control requests, oldest first.
    pub fn take_control_outcomes(&mut self) -> Vec<ControlOutcome> {
        self.control_outcomes.drain()
    }

    // ── Raw memory access ─────────────────────────────────────

    pub fn request_raw_read(&mut self, address: u64, size: usize) -> RawRequestId {
        self.reader.request_raw_read(address, size, &self.model)
    }

    pub fn request_raw_write(&mut self, address: u64, data: Vec<u8>) -> RawRequestId {
        self.writer.request_raw_write(address, data, &self.model)
    }

    pub fn take_raw_read_outcomes(&mut self) -> Vec<RawReadOutcome> {
        self.reader.take_raw_read_outcomes()
    }

    pub fn take_raw_write_outcomes(&mut self) -> Vec<RawWriteOutcome> {
        self.writer.take_raw_write_outcomes()
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// The device went away: cancel every request, fail every queued
    /// write and drop all entries.
    pub fn disconnect(&mut self) {
        let now = self.clock.now_us();
        let cancelled = self.dispatcher.reset();
        debug!("SyncService: {} requests cancelled", cancelled.len());
        for completion in cancelled {
            self.route(completion, now);
        }
        self.reader.reset();
        self.writer.reset();
        self.store.clear(now);
        info!("SyncService: disconnected");
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub fn reader(&self) -> &MemoryReader {
        &self.reader
    }

    pub fn writer(&self) -> &MemoryWriter {
        &self.writer
    }
}
