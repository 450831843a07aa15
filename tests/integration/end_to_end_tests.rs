//! Full service against the emulated device: value sync, watchers,
//! control plane, timeouts and disconnects.

use memsync::adapters::{EmulatedDevice, channel_link};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use memsync::app::{Link, MonotonicClock, SyncService};
use memsync::config::SyncConfig;
use memsync::datastore::{VariableDef, WatcherId};
use memsync::dispatch::PRIORITY_CONTROL;
use memsync::error::{DispatchError, Error, ProtocolError};
use memsync::protocol::{
    CommandId, EmbeddedDataType, Endianness, RequestData, ResponseCode, ResponseData, Value,
};

use crate::mock_link::{ManualClock, SilentLink, record, run, sim};

fn u32_var(addr: u64) -> VariableDef {
    VariableDef::new(addr, EmbeddedDataType::Uint32, Endianness::Little)
}

#[test]
fn three_variables_track_device_memory() {
    let (mut sim, _) = sim();
    for (i, addr) in [0x1000u64, 0x1004, 0x1008].into_iter().enumerate() {
        sim.link_mut().write_memory(addr, &(100 + i as u32).to_le_bytes());
    }
    let ids: Vec<_> = [0x1000, 0x1004, 0x1008]
        .into_iter()
        .enumerate()
        .map(|(i, addr)| sim.store_mut().add_variable(format!("/v{i}"), u32_var(addr)).unwrap())
        .collect();
    let logs: Vec<_> = ids.iter().map(|&id| record(&mut sim, id, WatcherId(1))).collect();

    run(&mut sim, 2);
    for (i, &id) in ids.iter().enumerate() {
        assert_eq!(sim.store().get_entry(id).unwrap().value(), Some(Value::UInt(100 + i as u64)));
        assert_eq!(logs[i].borrow().last().copied().flatten(), Some(Value::UInt(100 + i as u64)));
    }
    // Contiguous variables go out as one block.
    assert_eq!(sim.link().memory_reads()[0].len, 12);

    sim.link_mut().write_memory(0x1004, &7u32.to_le_bytes());
    run(&mut sim, 2);
    assert_eq!(sim.store().get_entry(ids[1]).unwrap().value(), Some(Value::UInt(7)));

    // No watchers left: reading stops once the in-flight read lands.
    for &id in &ids {
        assert!(sim.store_mut().stop_watching(id, WatcherId(1)));
    }
    run(&mut sim, 2);
    sim.link_mut().clear_history();
    run(&mut sim, 10);
    assert!(sim.link().memory_reads().is_empty());
}

#[test]
fn heartbeat_challenge_is_complemented() {
    let (mut sim, _) = sim();
    let connect = sim.device().codec.comm_connect();
    let ticket = sim.submit_control(connect);
    run(&mut sim, 2);
    let outcomes = sim.take_control_outcomes();
    assert_eq!(outcomes[0].ticket, ticket);
    let Ok(ResponseData::Connect { session_id }) = outcomes[0].result else {
        panic!("connect failed: {:?}", outcomes[0].result);
    };

    for challenge in [0u16, 1, 0x1234, 0xFFFF] {
        let ticket = sim.heartbeat(session_id, challenge);
        run(&mut sim, 2);
        let outcome = sim.take_control_outcomes().pop().unwrap();
        assert_eq!(outcome.ticket, ticket);
        assert_eq!(
            outcome.result,
            Ok(ResponseData::Heartbeat {
                session_id,
                challenge_response: !challenge,
            })
        );
    }
}

#[test]
fn control_requests_jump_the_queue() {
    let clock = ManualClock::default();
    let mut sim = SyncService::new(&SyncConfig::default(), SilentLink::default(), clock.clone()).unwrap();
    let id = sim.store_mut().add_variable("/v", u32_var(0x10)).unwrap();
    sim.store_mut().start_watching(id, WatcherId(1), |_, _| {}).unwrap();
    sim.store_mut().update_target_value(id, Value::UInt(1), 0).unwrap();

    // Write goes out first; the read and the control request queue behind it.
    sim.process();
    let discover = sim.device().codec.comm_discover();
    sim.submit_control(discover);
    clock.advance(SyncConfig::default().request_timeout_us);
    sim.process();

    let commands: Vec<u8> = sim.link().sent.iter().map(|r| r.command).collect();
    assert_eq!(commands[..2], [CommandId::MemoryControl as u8, CommandId::CommControl as u8]);
    assert!(PRIORITY_CONTROL > memsync::dispatch::PRIORITY_WRITE);
}

#[test]
fn timeout_fails_write_and_reads_recover() {
    let (mut sim, clock) = sim();
    sim.link_mut().write_memory(0x10, &[1, 0, 0, 0]);
    let id = sim.store_mut().add_variable("/v", u32_var(0x10)).unwrap();
    sim.store_mut().update_target_value(id, Value::UInt(9), 0).unwrap();
    sim.link_mut().drop_next(1);

    run(&mut sim, 1);
    clock.advance(SyncConfig::default().request_timeout_us);
    run(&mut sim, 1);

    let outcomes = sim.store_mut().take_write_outcomes();
    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].success);
    assert_eq!(
        outcomes[0].reason.as_deref(),
        Some(DispatchError::Timeout.to_string().as_str())
    );
    assert_eq!(sim.dispatch_stats().timeouts, 1);

    sim.store_mut().start_watching(id, WatcherId(1), |_, _| {}).unwrap();
    run(&mut sim, 3);
    assert_eq!(sim.store().get_entry(id).unwrap().value(), Some(Value::UInt(1)));
}

#[test]
fn corrupted_response_is_dropped() {
    let (mut sim, _) = sim();
    sim.link_mut().write_memory(0x10, &[5, 0, 0, 0]);
    let id = sim.store_mut().add_variable("/v", u32_var(0x10)).unwrap();
    sim.store_mut().start_watching(id, WatcherId(1), |_, _| {}).unwrap();
    sim.link_mut().corrupt_next();

    run(&mut sim, 2);
    assert_eq!(sim.store().get_entry(id).unwrap().value(), None);
    assert_eq!(sim.dispatch_stats().bad_frames, 1);
    assert_eq!(sim.reader().stats().dropped, 1);

    run(&mut sim, 2);
    assert_eq!(sim.store().get_entry(id).unwrap().value(), Some(Value::UInt(5)));
}

#[test]
fn unsupported_command_reports_not_ok() {
    let (mut sim, _) = sim();
    let request = memsync::protocol::Request {
        command: CommandId::GetInfo as u8,
        subfn: 0x7F,
        payload: Vec::new(),
    };
    sim.submit_control(request);
    run(&mut sim, 2);
    let outcome = sim.take_control_outcomes().pop().unwrap();
    assert_eq!(
        outcome.result,
        Err(Error::Protocol(ProtocolError::NotOk(ResponseCode::UnsupportedFeature)))
    );
}

#[test]
fn link_down_then_disconnect_clears_everything() {
    let (mut sim, _) = sim();
    let id = sim.store_mut().add_variable("/v", u32_var(0x10)).unwrap();
    sim.store_mut().start_watching(id, WatcherId(1), |_, _| {}).unwrap();
    sim.store_mut().update_target_value(id, Value::UInt(1), 0).unwrap();
    sim.store_mut().update_target_value(id, Value::UInt(2), 0).unwrap();
    sim.request_raw_read(0x100, 4);

    sim.link_mut().set_up(false);
    run(&mut sim, 3);
    assert!(sim.link().history().is_empty());

    sim.disconnect();
    assert!(sim.store().is_empty());
    let outcomes = sim.store_mut().take_write_outcomes();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| !o.success));
    assert!(sim.take_raw_read_outcomes()[0].result.is_err());
}

#[test]
fn user_command_is_echoed() {
    let (mut sim, _) = sim();
    let request = sim.device().codec.user_command(3, vec![1, 2, 3]);
    sim.submit_control(request);
    run(&mut sim, 2);
    assert_eq!(
        sim.take_control_outcomes().pop().unwrap().result,
        Ok(ResponseData::UserCommand {
            subfn: 3,
            data: vec![1, 2, 3],
        })
    );
    assert!(matches!(sim.link().history()[0], RequestData::UserCommand { .. }));
}

#[test]
fn sync_over_channel_link_with_device_thread() {
    let (link, end) = channel_link();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_device = Arc::clone(&stop);
    let device_thread = std::thread::spawn(move || {
        let mut device = EmulatedDevice::default();
        device.write_memory(0x4000, &0xCAFE_F00Du32.to_le_bytes());
        while !stop_device.load(Ordering::Acquire) {
            if let Some(bytes) = end.take_outgoing() {
                device.send(&bytes).unwrap();
            }
            if let Some(bytes) = device.recv() {
                end.deliver(&bytes).unwrap();
            }
            std::thread::yield_now();
        }
    });

    let mut sim = SyncService::new(&SyncConfig::default(), link, MonotonicClock::new()).unwrap();
    let id = sim.store_mut().add_variable("/v", u32_var(0x4000)).unwrap();
    sim.store_mut().start_watching(id, WatcherId(1), |_, _| {}).unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while sim.store().get_entry(id).unwrap().value().is_none() && std::time::Instant::now() < deadline {
        sim.process();
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert_eq!(sim.store().get_entry(id).unwrap().value(), Some(Value::UInt(0xCAFE_F00D)));

    stop.store(true, Ordering::Release);
    device_thread.join().unwrap();
}
