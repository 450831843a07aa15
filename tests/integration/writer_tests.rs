//! Write scheduling: ordering, refusals, aliases and backpressure.

use memsync::config::SyncConfig;
use memsync::datastore::{AliasDef, RpvDef, VariableDef};
use memsync::error::StoreError;
use memsync::memory::{MemoryRegion, RegionMap};
use memsync::protocol::{DeviceParams, EmbeddedDataType, Endianness, RequestData, Value};

use crate::mock_link::{config_with, run, sim, sim_with};

fn u8_var(addr: u64) -> VariableDef {
    VariableDef::new(addr, EmbeddedDataType::Uint8, Endianness::Little)
}

/// `(address, first data byte)` of every plain memory write, in order.
fn written(sim: &crate::mock_link::Sim) -> Vec<(u64, u8)> {
    sim.link()
        .history()
        .iter()
        .filter_map(|r| match r {
            RequestData::WriteMemory(blocks) => Some((blocks[0].address, blocks[0].data[0])),
            _ => None,
        })
        .collect()
}

#[test]
fn burst_is_written_in_order() {
    let (mut sim, _) = sim();
    let id = sim.store_mut().add_variable("/v", u8_var(0x10)).unwrap();
    for v in 1..=5u64 {
        sim.store_mut().update_target_value(id, Value::UInt(v), 0).unwrap();
    }
    run(&mut sim, 8);

    assert_eq!(written(&sim), (1..=5).map(|v| (0x10, v)).collect::<Vec<_>>());
    let outcomes = sim.store_mut().take_write_outcomes();
    assert_eq!(outcomes.len(), 5);
    assert!(outcomes.iter().all(|o| o.success));
    assert_eq!(
        outcomes.iter().map(|o| o.value).collect::<Vec<_>>(),
        (1..=5).map(Value::UInt).collect::<Vec<_>>()
    );
    assert_eq!(sim.store().get_entry(id).unwrap().value(), Some(Value::UInt(5)));
    assert_eq!(sim.link().read_memory(0x10, 1), vec![5]);
}

#[test]
fn entries_take_turns() {
    let (mut sim, _) = sim();
    let a = sim.store_mut().add_variable("/a", u8_var(0x10)).unwrap();
    let b = sim.store_mut().add_variable("/b", u8_var(0x20)).unwrap();
    for v in [1, 2] {
        sim.store_mut().update_target_value(a, Value::UInt(v), 0).unwrap();
        sim.store_mut().update_target_value(b, Value::UInt(v), 0).unwrap();
    }
    run(&mut sim, 6);
    assert_eq!(written(&sim), vec![(0x10, 1), (0x20, 1), (0x10, 2), (0x20, 2)]);
}

#[test]
fn protected_writes_fail_without_traffic() {
    let regions = RegionMap::new(
        vec![MemoryRegion::new(0x100, 0x10)],
        vec![MemoryRegion::new(0x800, 0x10)],
    );
    let (mut sim, _) = sim_with(&config_with(DeviceParams::default(), regions));
    let forbidden = sim.store_mut().add_variable("/f", u8_var(0x105)).unwrap();
    let readonly = sim.store_mut().add_variable("/ro", u8_var(0x80F)).unwrap();
    sim.store_mut().update_target_value(forbidden, Value::UInt(1), 0).unwrap();
    sim.store_mut().update_target_value(readonly, Value::UInt(1), 0).unwrap();
    let raw = sim.request_raw_write(0x7F0, vec![0; 0x20]);

    run(&mut sim, 4);

    assert!(sim.link().history().is_empty());
    let outcomes = sim.store_mut().take_write_outcomes();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| !o.success && o.reason.is_some()));
    let raw_outcomes = sim.take_raw_write_outcomes();
    assert_eq!(raw_outcomes[0].id, raw);
    assert!(raw_outcomes[0].result.is_err());
}

#[test]
fn alias_write_is_translated_and_completes_with_target() {
    let (mut sim, _) = sim();
    let target = sim
        .store_mut()
        .add_variable("/t", VariableDef::new(0x40, EmbeddedDataType::Sint32, Endianness::Little))
        .unwrap();
    let alias = sim
        .store_mut()
        .add_alias("/alias", AliasDef::new(target).with_gain(2.0).with_offset(10.0))
        .unwrap();
    sim.store_mut().update_target_value(alias, Value::Float(50.0), 0).unwrap();
    run(&mut sim, 3);

    assert_eq!(sim.link().read_memory(0x40, 4), 20i32.to_le_bytes().to_vec());
    assert_eq!(sim.store().get_entry(target).unwrap().value(), Some(Value::Int(20)));
    assert_eq!(sim.store().get_entry(alias).unwrap().value(), Some(Value::Float(50.0)));

    let outcomes = sim.store_mut().take_write_outcomes();
    let entries: Vec<_> = outcomes.iter().map(|o| o.entry).collect();
    assert_eq!(entries, vec![target, alias]);
    assert!(outcomes.iter().all(|o| o.success));
}

#[test]
fn rpv_write_reaches_device() {
    let (mut sim, _) = sim();
    sim.link_mut().add_rpv(0x22, EmbeddedDataType::Sint8, Value::Int(0));
    let defs = sim.link().rpv_definitions();
    sim.set_rpv_definitions(defs);
    let id = sim
        .store_mut()
        .add_rpv("/rpv", RpvDef { id: 0x22, dtype: EmbeddedDataType::Sint8 })
        .unwrap();
    sim.store_mut().update_target_value(id, Value::Int(-100), 0).unwrap();
    run(&mut sim, 3);

    assert_eq!(sim.link().rpv(0x22), Some(Value::Int(-100)));
    assert_eq!(sim.store().get_entry(id).unwrap().value(), Some(Value::Int(-100)));
}

#[test]
fn unencodable_value_fails_synchronously() {
    let (mut sim, _) = sim();
    let id = sim.store_mut().add_variable("/v", u8_var(0x10)).unwrap();
    sim.store_mut().update_target_value(id, Value::Int(-1), 0).unwrap();
    sim.store_mut().update_target_value(id, Value::UInt(3), 0).unwrap();
    run(&mut sim, 4);

    let outcomes = sim.store_mut().take_write_outcomes();
    assert_eq!(outcomes.len(), 2);
    assert!(!outcomes[0].success);
    assert!(outcomes[1].success);
    assert_eq!(written(&sim), vec![(0x10, 3)]);
}

#[test]
fn full_queue_rejects_write() {
    let config = SyncConfig {
        write_queue_depth: 2,
        ..SyncConfig::default()
    };
    let (mut sim, _) = sim_with(&config);
    let id = sim.store_mut().add_variable("/v", u8_var(0x10)).unwrap();
    let store = sim.store_mut();
    store.update_target_value(id, Value::UInt(1), 0).unwrap();
    store.update_target_value(id, Value::UInt(2), 0).unwrap();
    assert_eq!(
        store.update_target_value(id, Value::UInt(3), 0),
        Err(StoreError::WriteQueueFull(id))
    );

    run(&mut sim, 2);
    assert!(sim.store_mut().update_target_value(id, Value::UInt(3), 0).is_ok());
}
