//! Read scheduling against the emulated device: batching, fairness and
//! protected regions.

use std::collections::BTreeSet;

use memsync::adapters::EmulatedDevice;
use memsync::app::SyncService;
use memsync::config::SyncConfig;
use memsync::datastore::{EntryId, RpvDef, VariableDef, WatcherId};
use memsync::dispatch::OUTCOME_QUEUE_DEPTH;
use memsync::memory::{MemoryRegion, RegionMap};
use memsync::protocol::{AddressSize, DeviceParams, EmbeddedDataType, Endianness, RequestData, Value};

use crate::mock_link::{HoldingLink, ManualClock, config_with, run, sim, sim_with};

const W: WatcherId = WatcherId(7);

fn watch_u8_vars(sim: &mut crate::mock_link::Sim, addresses: &[u64]) -> Vec<EntryId> {
    addresses
        .iter()
        .enumerate()
        .map(|(i, &addr)| {
            let store = sim.store_mut();
            let id = store
                .add_variable(
                    format!("/v{i}"),
                    VariableDef::new(addr, EmbeddedDataType::Uint8, Endianness::Little),
                )
                .unwrap();
            store.start_watching(id, W, |_, _| {}).unwrap();
            id
        })
        .collect()
}

/// Indices (into `addresses`) covered by each memory read, in order.
fn read_batches(sim: &crate::mock_link::Sim, addresses: &[u64]) -> Vec<BTreeSet<usize>> {
    sim.link()
        .history()
        .iter()
        .filter_map(|r| match r {
            RequestData::ReadMemory(blocks) => Some(
                blocks
                    .iter()
                    .flat_map(|b| (b.address..b.address + u64::from(b.len)).collect::<Vec<_>>())
                    .filter_map(|a| addresses.iter().position(|&x| x == a))
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

// ── Round-robin fairness ─────────────────────────────────────

#[test]
fn cursor_wraps_across_batches() {
    // 32-bit addresses: 6 bytes of overhead + 1 data byte per variable,
    // so a 70-byte response carries exactly 10 of them.
    let params = DeviceParams {
        max_tx_data_size: 70,
        ..DeviceParams::default()
    };
    let (mut sim, _) = sim_with(&config_with(params, RegionMap::default()));
    let addresses: Vec<u64> = (0..15).map(|i| 0x1000 + i * 0x10).collect();
    watch_u8_vars(&mut sim, &addresses);

    run(&mut sim, 4);

    let batches = read_batches(&sim, &addresses);
    assert!(batches.len() >= 3);
    assert_eq!(batches[0], (0..10).collect());
    assert_eq!(batches[1], (10..15).chain(0..5).collect());
    assert_eq!(batches[2], (5..15).collect());
}

#[test]
fn adjacent_variables_merge_into_one_block() {
    let (mut sim, _) = sim();
    let addresses = [0x2000, 0x2001, 0x2002, 0x2003, 0x3000];
    watch_u8_vars(&mut sim, &addresses);
    run(&mut sim, 2);

    let RequestData::ReadMemory(blocks) = &sim.link().history()[0] else {
        panic!("expected a memory read");
    };
    assert_eq!(blocks.len(), 2);
    assert_eq!((blocks[0].address, blocks[0].len), (0x2000, 4));
    assert_eq!((blocks[1].address, blocks[1].len), (0x3000, 1));
}

#[test]
fn categories_alternate() {
    let (mut sim, _) = sim();
    sim.link_mut()
        .add_rpv(0x10, EmbeddedDataType::Uint16, Value::UInt(77));
    let defs = sim.link().rpv_definitions();
    sim.set_rpv_definitions(defs);
    watch_u8_vars(&mut sim, &[0x100]);
    let rpv = sim
        .store_mut()
        .add_rpv("/rpv", RpvDef { id: 0x10, dtype: EmbeddedDataType::Uint16 })
        .unwrap();
    sim.store_mut().start_watching(rpv, W, |_, _| {}).unwrap();
    sim.request_raw_read(0x500, 4);

    run(&mut sim, 8);

    let kinds: Vec<&str> = sim
        .link()
        .history()
        .iter()
        .take(6)
        .map(|r| match r {
            RequestData::ReadMemory(b) if b[0].address == 0x500 => "raw",
            RequestData::ReadMemory(_) => "var",
            RequestData::ReadRpv(_) => "rpv",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["var", "rpv", "raw", "var", "rpv", "var"]);
    assert_eq!(sim.store().get_entry(rpv).unwrap().value(), Some(Value::UInt(77)));
    assert_eq!(sim.take_raw_read_outcomes().len(), 1);
}

#[test]
fn rpv_batch_respects_response_size() {
    // 4 bytes per Uint16 RPV in the response: 20 bytes fit 5.
    let params = DeviceParams {
        max_tx_data_size: 20,
        ..DeviceParams::default()
    };
    let (mut sim, _) = sim_with(&config_with(params, RegionMap::default()));
    for id in 0..8u16 {
        sim.link_mut().add_rpv(id, EmbeddedDataType::Uint16, Value::UInt(u64::from(id)));
        let entry = sim
            .store_mut()
            .add_rpv(format!("/rpv/{id}"), RpvDef { id, dtype: EmbeddedDataType::Uint16 })
            .unwrap();
        sim.store_mut().start_watching(entry, W, |_, _| {}).unwrap();
    }
    let defs = sim.link().rpv_definitions();
    sim.set_rpv_definitions(defs);

    run(&mut sim, 3);

    let sizes: Vec<usize> = sim
        .link()
        .history()
        .iter()
        .filter_map(|r| match r {
            RequestData::ReadRpv(ids) => Some(ids.len()),
            _ => None,
        })
        .collect();
    assert_eq!(sizes[..2], [5, 3]);
}

// ── Protected regions ────────────────────────────────────────

#[test]
fn forbidden_entries_are_never_read() {
    let regions = RegionMap::new(vec![MemoryRegion::new(0x100, 4)], Vec::new());
    let (mut sim, _) = sim_with(&config_with(DeviceParams::default(), regions.clone()));
    sim.link_mut().write_memory(0x200, &[0x22]);
    sim.link_mut().write_memory(0x300, &[0x33]);
    let ids = watch_u8_vars(&mut sim, &[0x103, 0x200, 0x300]);

    run(&mut sim, 20);

    let reads = sim.link().memory_reads();
    assert!(!reads.is_empty());
    for block in reads {
        assert!(!regions.is_forbidden(block.address, u64::from(block.len)));
    }
    let store = sim.store();
    assert_eq!(store.get_entry(ids[0]).unwrap().value(), None);
    assert_eq!(store.get_entry(ids[1]).unwrap().value(), Some(Value::UInt(0x22)));
    assert_eq!(store.get_entry(ids[2]).unwrap().value(), Some(Value::UInt(0x33)));
}

#[test]
fn raw_read_of_forbidden_memory_fails_without_traffic() {
    let regions = RegionMap::new(vec![MemoryRegion::new(0x100, 4)], Vec::new());
    let (mut sim, _) = sim_with(&config_with(DeviceParams::default(), regions));
    let id = sim.request_raw_read(0xF0, 0x20);
    let outcomes = sim.take_raw_read_outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].id, id);
    assert!(outcomes[0].result.is_err());

    run(&mut sim, 4);
    assert!(sim.link().history().is_empty());
}

#[test]
fn unwatched_variables_are_not_read() {
    let (mut sim, _) = sim();
    sim.store_mut()
        .add_variable("/idle", VariableDef::new(0x40, EmbeddedDataType::Uint32, Endianness::Little))
        .unwrap();
    run(&mut sim, 5);
    assert!(sim.link().history().is_empty());
}

// ── Reconfiguration and limits ───────────────────────────────

#[test]
fn reconfigure_mid_read_keeps_raw_read_on_its_own_address() {
    let config = SyncConfig::default();
    let mut device = EmulatedDevice::new(config.device, config.regions.clone());
    device.write_memory(0x1000, &[0xAA]);
    device.write_memory(0x2000, &[0x55]);
    let mut sim = SyncService::new(&config, HoldingLink::new(device), ManualClock::default()).unwrap();

    let id = sim
        .store_mut()
        .add_variable("/v", VariableDef::new(0x1000, EmbeddedDataType::Uint8, Endianness::Little))
        .unwrap();
    sim.store_mut().start_watching(id, W, |_, _| {}).unwrap();
    sim.link_mut().hold = true;
    sim.process();
    assert!(sim.reader().is_pending());

    // The variable read is still unanswered when the device is reconfigured.
    sim.store_mut().stop_watching(id, W);
    sim.configure_device(config.device, config.regions.clone());
    let raw = sim.request_raw_read(0x2000, 1);
    sim.process();

    sim.link_mut().hold = false;
    for _ in 0..6 {
        sim.process();
    }

    let outcomes = sim.take_raw_read_outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].id, raw);
    assert_eq!(outcomes[0].address, 0x2000);
    assert_eq!(outcomes[0].result, Ok(vec![0x55]));
    // The late variable response still updated the variable it was for.
    assert_eq!(sim.store().get_entry(id).unwrap().value(), Some(Value::UInt(0xAA)));
}

#[test]
fn raw_read_above_configured_limit_fails_immediately() {
    let params = DeviceParams {
        address_size: AddressSize::Bits64,
        ..DeviceParams::default()
    };
    let config = SyncConfig {
        max_raw_read_size: 1024,
        ..config_with(params, RegionMap::default())
    };
    let (mut sim, _) = sim_with(&config);

    let huge = sim.request_raw_read(0, usize::MAX);
    let over = sim.request_raw_read(0x100, 1025);
    let at_limit = sim.request_raw_read(0x100, 1024);

    let outcomes = sim.take_raw_read_outcomes();
    assert_eq!(outcomes.iter().map(|o| o.id).collect::<Vec<_>>(), vec![huge, over]);
    assert!(outcomes.iter().all(|o| o.result.is_err()));

    run(&mut sim, 40);
    let outcomes = sim.take_raw_read_outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].id, at_limit);
    assert_eq!(outcomes[0].result.as_ref().map(Vec::len), Ok(1024));
}

#[test]
fn undrained_raw_outcomes_stay_bounded() {
    let (mut sim, _) = sim();
    let ids: Vec<_> = (0..OUTCOME_QUEUE_DEPTH + 20)
        .map(|_| sim.request_raw_read(0x10, 0))
        .collect();

    let outcomes = sim.take_raw_read_outcomes();
    assert_eq!(outcomes.len(), OUTCOME_QUEUE_DEPTH);
    assert_eq!(outcomes[0].id, ids[20]);
    assert_eq!(outcomes.last().map(|o| o.id), ids.last().copied());
}
