//! memsync-sim: runs the sync core against an emulated device.
//!
//! The emulator lives on its own thread behind a [`ChannelLink`], the way
//! a serial or socket transport would.  The main loop performs the
//! connection handshake over the control plane, registers a handful of
//! entries, then ticks the service, logging every value change.
//!
//! ```text
//! ┌────────────────────────┐  ChannelLink  ┌──────────────────────────┐
//! │ SyncService            │◀────────────▶│ device thread            │
//! │ reader · writer ·      │               │ EmulatedDevice           │
//! │ dispatcher · store     │               │ (counter, uptime RPV)    │
//! └────────────────────────┘               └──────────────────────────┘
//! ```
//!
//! Usage: `memsync-sim [config.json]`
#![deny(unused_must_use)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::{info, warn};

use memsync::adapters::{ChannelLink, EmulatedDevice, TransportEnd, channel_link};
use memsync::app::{Link, MonotonicClock, SyncService};
use memsync::config::SyncConfig;
use memsync::datastore::{AliasDef, Entry, RpvDef, VariableDef, WatcherId};
use memsync::error::Error;
use memsync::memory::{MemoryRegion, RegionMap};
use memsync::protocol::{
    Bitfield, DeviceParams, EmbeddedDataType, Endianness, RegionType, Request, ResponseData, Value,
};

type Sim = SyncService<ChannelLink, MonotonicClock>;

// ── Emulated target layout ────────────────────────────────────

const COUNTER_ADDR: u64 = 0x2000_0000;
const SETPOINT_ADDR: u64 = 0x2000_0004;
const FLAGS_ADDR: u64 = 0x2000_0008;
const SECRET_ADDR: u64 = 0x2000_0100;
const FLASH_ADDR: u64 = 0x0800_0000;
const RPV_UPTIME: u16 = 0x1000;

const RUN_FOR: Duration = Duration::from_secs(2);
const CONTROL_DEADLINE: Duration = Duration::from_secs(1);
const MONITOR: WatcherId = WatcherId(1);

// ── Configuration ─────────────────────────────────────────────

fn load_config() -> Result<SyncConfig> {
    let Some(path) = std::env::args().nth(1) else {
        info!("Config: defaults");
        return Ok(SyncConfig::default());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let config: SyncConfig = serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?;
    config.validate().context("invalid configuration")?;
    info!("Config: loaded from {}", path);
    Ok(config)
}

// ── Device thread ─────────────────────────────────────────────

fn spawn_device(params: DeviceParams, end: TransportEnd, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let regions = RegionMap::new(
            vec![MemoryRegion::new(SECRET_ADDR, 0x100)],
            vec![MemoryRegion::new(FLASH_ADDR, 0x1000)],
        );
        let mut device = EmulatedDevice::new(params, regions).with_display_name("memsync-sim target");
        device.add_rpv(RPV_UPTIME, EmbeddedDataType::Uint32, Value::UInt(0));
        device.write_memory(SETPOINT_ADDR, &1500u32.to_le_bytes());
        device.write_memory(FLAGS_ADDR, &[0b0000_0001]);

        let started = Instant::now();
        let mut counter: u32 = 0;
        while !stop.load(Ordering::Acquire) {
            counter = counter.wrapping_add(1);
            device.write_memory(COUNTER_ADDR, &counter.to_le_bytes());
            device.set_rpv(RPV_UPTIME, Value::UInt(started.elapsed().as_millis() as u64));

            if let Some(bytes) = end.take_outgoing() {
                if let Err(e) = device.send(&bytes) {
                    warn!("Device: {}", e);
                }
            }
            if let Some(bytes) = device.recv() {
                // A full channel loses the response; the host times out.
                let _ = end.deliver(&bytes);
            }
            std::thread::sleep(Duration::from_micros(200));
        }
        info!("Device: stopped after {} requests", device.history().len());
    })
}

// ── Control plane ─────────────────────────────────────────────

/// Submit `request` and tick until its answer arrives.
fn control(sim: &mut Sim, request: Request, tick: Duration) -> Result<ResponseData> {
    let ticket = sim.submit_control(request);
    let deadline = Instant::now() + CONTROL_DEADLINE;
    while Instant::now() < deadline {
        sim.process();
        if let Some(outcome) = sim
            .take_control_outcomes()
            .into_iter()
            .find(|o| o.ticket == ticket)
        {
            return outcome.result.map_err(anyhow::Error::from);
        }
        std::thread::sleep(tick);
    }
    bail!("control request {ticket} got no answer")
}

/// Discover, connect and learn the device.  Returns the session id.
fn handshake(sim: &mut Sim, tick: Duration) -> Result<u32> {
    let codec = sim.device().codec.clone();

    let ResponseData::Discover(info) = control(sim, codec.comm_discover(), tick)? else {
        bail!("unexpected discover answer");
    };
    info!(
        "Handshake: found '{}' protocol {}.{}",
        info.display_name, info.protocol_major, info.protocol_minor
    );

    let ResponseData::Connect { session_id } = control(sim, codec.comm_connect(), tick)? else {
        bail!("unexpected connect answer");
    };
    info!("Handshake: session 0x{:08X}", session_id);

    let ResponseData::GetParams(params) = control(sim, codec.comm_get_params(), tick)? else {
        bail!("unexpected params answer");
    };

    let ResponseData::SpecialRegionCount { readonly, forbidden } =
        control(sim, codec.get_special_region_count(), tick)?
    else {
        bail!("unexpected region count answer");
    };
    let mut regions = RegionMap::default();
    for (region_type, count) in [(RegionType::ReadOnly, readonly), (RegionType::Forbidden, forbidden)] {
        for index in 0..count {
            let request = codec.get_special_region_location(region_type, index);
            let ResponseData::SpecialRegionLocation { region, .. } = control(sim, request, tick)? else {
                bail!("unexpected region answer");
            };
            match region_type {
                RegionType::ReadOnly => regions.readonly.push(region),
                RegionType::Forbidden => regions.forbidden.push(region),
            }
        }
    }

    let ResponseData::RpvCount(rpv_count) = control(sim, codec.get_rpv_count(), tick)? else {
        bail!("unexpected RPV count answer");
    };
    let ResponseData::RpvDefinition(defs) = control(sim, codec.get_rpv_definition(0, rpv_count), tick)? else {
        bail!("unexpected RPV definition answer");
    };

    sim.configure_device(params, regions);
    sim.set_rpv_definitions(defs);
    Ok(session_id)
}

// ── Entries ───────────────────────────────────────────────────

fn log_change(_watcher: WatcherId, entry: &Entry) {
    if let Some(value) = entry.value() {
        info!("Value: {} = {}", entry.path(), value);
    }
}

fn register_entries(sim: &mut Sim) -> Result<()> {
    let store = sim.store_mut();
    let counter = store.add_variable(
        "/var/counter",
        VariableDef::new(COUNTER_ADDR, EmbeddedDataType::Uint32, Endianness::Little),
    )?;
    let setpoint = store.add_variable(
        "/var/setpoint",
        VariableDef::new(SETPOINT_ADDR, EmbeddedDataType::Uint32, Endianness::Little),
    )?;
    let mode = store.add_variable(
        "/var/flags/mode",
        VariableDef::new(FLAGS_ADDR, EmbeddedDataType::Uint8, Endianness::Little)
            .with_bitfield(Bitfield::new(1, 3))
            .map_err(Error::from)?,
    )?;
    let secret = store.add_variable(
        "/var/secret",
        VariableDef::new(SECRET_ADDR, EmbeddedDataType::Uint32, Endianness::Little),
    )?;
    let uptime = store.add_rpv(
        "/rpv/uptime_ms",
        RpvDef {
            id: RPV_UPTIME,
            dtype: EmbeddedDataType::Uint32,
        },
    )?;
    let percent = store.add_alias(
        "/alias/setpoint_pct",
        AliasDef::new(setpoint).with_gain(0.1).with_limits(0.0, 200.0),
    )?;

    for id in [counter, setpoint, mode, secret, uptime, percent] {
        store.start_watching(id, MONITOR, log_change)?;
    }

    let now = sim.now_us();
    let store = sim.store_mut();
    store.update_target_value(percent, Value::Float(120.0), now)?;
    store.update_target_value(mode, Value::UInt(5), now)?;
    // Refused without traffic: read-only region.
    let flash = store.add_variable(
        "/var/flash_word",
        VariableDef::new(FLASH_ADDR, EmbeddedDataType::Uint32, Endianness::Little),
    )?;
    store.update_target_value(flash, Value::UInt(0xDEAD_BEEF), now)?;

    sim.request_raw_read(COUNTER_ADDR, 12);
    sim.request_raw_write(FLASH_ADDR, vec![0; 4]);
    Ok(())
}

// ── Main ──────────────────────────────────────────────────────

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("memsync-sim v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    let tick = Duration::from_millis(u64::from(config.tick_interval_ms.max(1)));

    let (link, end) = channel_link();
    let stop = Arc::new(AtomicBool::new(false));
    let device = spawn_device(config.device, end, Arc::clone(&stop));

    let mut sim = SyncService::new(&config, link, MonotonicClock::new())?;
    let session = handshake(&mut sim, tick)?;
    register_entries(&mut sim)?;

    let heartbeat_every = Duration::from_micros(u64::from(sim.device().params.heartbeat_timeout_us) / 2);
    let mut last_heartbeat = Instant::now();
    let mut challenge: u16 = 0;
    let mut pending_heartbeat: Option<(u32, u16)> = None;
    let started = Instant::now();

    info!("Sim: running for {:?}", RUN_FOR);
    while started.elapsed() < RUN_FOR && sim.link().is_up() {
        sim.process();

        if last_heartbeat.elapsed() >= heartbeat_every && pending_heartbeat.is_none() {
            challenge = challenge.wrapping_add(0x1111);
            pending_heartbeat = Some((sim.heartbeat(session, challenge), challenge));
            last_heartbeat = Instant::now();
        }
        for outcome in sim.take_control_outcomes() {
            let Some((ticket, sent)) = pending_heartbeat else {
                continue;
            };
            if outcome.ticket != ticket {
                continue;
            }
            pending_heartbeat = None;
            match outcome.result {
                Ok(ResponseData::Heartbeat { challenge_response, .. }) if challenge_response == !sent => {
                    info!("Heartbeat: ok");
                }
                other => warn!("Heartbeat: bad answer {:?}", other),
            }
        }

        for w in sim.store_mut().take_write_outcomes() {
            match w.reason {
                None => info!("Write: {} <- {} done", w.entry, w.value),
                Some(reason) => warn!("Write: {} <- {} failed: {}", w.entry, w.value, reason),
            }
        }
        for r in sim.take_raw_read_outcomes() {
            match r.result {
                Ok(data) => info!("Raw read 0x{:X}: {:02X?}", r.address, data),
                Err(reason) => warn!("Raw read 0x{:X} failed: {}", r.address, reason),
            }
        }
        for r in sim.take_raw_write_outcomes() {
            if let Err(reason) = r.result {
                warn!("Raw write 0x{:X} failed: {}", r.address, reason);
            }
        }

        std::thread::sleep(tick);
    }

    let disconnect = sim.device().codec.comm_disconnect(session);
    if let Err(e) = control(&mut sim, disconnect, tick) {
        warn!("Sim: disconnect not acknowledged: {}", e);
    }
    sim.disconnect();

    let stats = sim.dispatch_stats();
    info!(
        "Sim: sent={} completed={} failed={} timeouts={} bad_frames={}",
        stats.sent, stats.completed, stats.failed, stats.timeouts, stats.bad_frames
    );
    let reads = sim.reader().stats();
    info!(
        "Sim: variable_reads={} rpv_reads={} raw_chunks={} dropped={}",
        reads.variable_reads, reads.rpv_reads, reads.raw_chunks, reads.dropped
    );

    stop.store(true, Ordering::Release);
    if device.join().is_err() {
        bail!("device thread panicked");
    }
    Ok(())
}
