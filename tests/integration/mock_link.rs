//! Shared test doubles: a hand-driven clock, a link that never answers,
//! a link that holds answers back, and helpers to build a service
//! around the emulated device.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use memsync::adapters::EmulatedDevice;
use memsync::app::{Clock, Link, LinkError, SyncService};
use memsync::config::SyncConfig;
use memsync::datastore::{Entry, EntryId, WatcherId};
use memsync::memory::RegionMap;
use memsync::protocol::{DeviceParams, FrameDecoder, FrameKind, Request, Value};

// ── ManualClock ───────────────────────────────────────────────

/// Time only moves when the test says so.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

#[allow(dead_code)]
impl ManualClock {
    pub fn advance(&self, us: u64) {
        self.now.set(self.now.get() + us);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.get()
    }
}

// ── SilentLink ────────────────────────────────────────────────

/// Accepts every request and never answers.
#[derive(Default)]
pub struct SilentLink {
    pub sent: Vec<Request>,
    decoder: Option<FrameDecoder>,
}

impl Link for SilentLink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let decoder = self
            .decoder
            .get_or_insert_with(|| FrameDecoder::new(FrameKind::Request, 4096));
        decoder.feed(bytes);
        while let Some(Ok(frame)) = decoder.next_frame() {
            if let Ok(request) = Request::from_bytes(&frame) {
                self.sent.push(request);
            }
        }
        Ok(())
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn is_up(&self) -> bool {
        true
    }
}

// ── HoldingLink ───────────────────────────────────────────────

/// Wraps the emulated device and keeps its answers back while `hold`
/// is set, so a request stays in flight for as long as the test needs.
pub struct HoldingLink {
    pub device: EmulatedDevice,
    pub hold: bool,
    held: Vec<u8>,
}

#[allow(dead_code)]
impl HoldingLink {
    pub fn new(device: EmulatedDevice) -> Self {
        Self {
            device,
            hold: false,
            held: Vec::new(),
        }
    }
}

impl Link for HoldingLink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.device.send(bytes)
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        if let Some(bytes) = self.device.recv() {
            self.held.extend_from_slice(&bytes);
        }
        if self.hold || self.held.is_empty() {
            return None;
        }
        Some(core::mem::take(&mut self.held))
    }

    fn is_up(&self) -> bool {
        self.device.is_up()
    }
}

// ── Service builders ──────────────────────────────────────────

pub type Sim = SyncService<EmulatedDevice, ManualClock>;

pub fn config_with(params: DeviceParams, regions: RegionMap) -> SyncConfig {
    SyncConfig {
        device: params,
        regions,
        ..SyncConfig::default()
    }
}

/// A service talking to an emulated device that shares its parameters
/// and regions.
pub fn sim_with(config: &SyncConfig) -> (Sim, ManualClock) {
    let clock = ManualClock::default();
    let device = EmulatedDevice::new(config.device, config.regions.clone());
    let sim = SyncService::new(config, device, clock.clone()).expect("valid config");
    (sim, clock)
}

pub fn sim() -> (Sim, ManualClock) {
    sim_with(&SyncConfig::default())
}

pub fn run(sim: &mut Sim, ticks: usize) {
    for _ in 0..ticks {
        sim.process();
    }
}

/// Watch `id` and record every value the watcher is told about.
pub fn record(sim: &mut Sim, id: EntryId, watcher: WatcherId) -> Rc<RefCell<Vec<Option<Value>>>> {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    sim.store_mut()
        .start_watching(id, watcher, move |_, e: &Entry| sink.borrow_mut().push(e.value()))
        .expect("entry exists");
    log
}
