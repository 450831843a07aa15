//! Property tests for the core data structures and wire helpers.
//!
//! Runs on the host with proptest.

use std::collections::BTreeMap;

use memsync::datastore::{AliasDef, ValueStore, VariableDef};
use memsync::memory::ByteRangeStore;
use memsync::protocol::{
    EmbeddedDataType, Endianness, FrameDecoder, FrameKind, ProtocolCodec, Request, ResponseData, Value,
    decode_value, encode_value,
};
use proptest::prelude::*;

// ── Byte ranges ───────────────────────────────────────────────

#[derive(Debug, Clone)]
enum RangeOp {
    Write(u64, Vec<u8>),
    AddEmpty(u64, usize),
    Delete(u64, usize),
}

fn range_op() -> impl Strategy<Value = RangeOp> {
    prop_oneof![
        (0u64..256, proptest::collection::vec(any::<u8>(), 1..24)).prop_map(|(a, d)| RangeOp::Write(a, d)),
        (0u64..256, 1usize..24).prop_map(|(a, n)| RangeOp::AddEmpty(a, n)),
        (0u64..256, 1usize..32).prop_map(|(a, n)| RangeOp::Delete(a, n)),
    ]
}

/// Apply `op` to both the store and a byte-per-address model.
fn apply(store: &mut ByteRangeStore, model: &mut BTreeMap<u64, u8>, op: &RangeOp) {
    match op {
        RangeOp::Write(a, d) => {
            store.write(*a, d).unwrap();
            for (i, b) in d.iter().enumerate() {
                model.insert(a + i as u64, *b);
            }
        }
        RangeOp::AddEmpty(a, n) => {
            store.add_empty(*a, *n).unwrap();
            for i in 0..*n as u64 {
                model.insert(a + i, 0);
            }
        }
        RangeOp::Delete(a, n) => {
            store.delete(*a, *n).unwrap();
            for i in 0..*n as u64 {
                model.remove(&(a + i));
            }
        }
    }
}

proptest! {
    /// Stored ranges are sorted, never overlap and never touch, whatever
    /// sequence of operations produced them.
    #[test]
    fn ranges_stay_sorted_and_disjoint(ops in proptest::collection::vec(range_op(), 1..40)) {
        let mut store = ByteRangeStore::with_data();
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&mut store, &mut model, op);
            let ranges: Vec<_> = store.ranges().collect();
            for pair in ranges.windows(2) {
                prop_assert!(pair[0].end() < pair[1].start, "ranges {:?} overlap or touch", pair);
            }
            for r in &ranges {
                prop_assert!(r.len > 0);
                prop_assert_eq!(r.data.map(<[u8]>::len), Some(r.len));
            }
        }

        // Content agrees with the model, byte for byte.
        let covered: usize = store.ranges().map(|r| r.len).sum();
        prop_assert_eq!(covered, model.len());
        for (&addr, &byte) in &model {
            prop_assert_eq!(store.read(addr, 1).unwrap(), &[byte][..]);
        }
    }

    /// Deleting a window leaves every byte outside it untouched and the
    /// window itself unreadable.
    #[test]
    fn delete_only_touches_its_window(
        ops in proptest::collection::vec(range_op(), 0..20),
        start in 0u64..256,
        len in 1usize..48,
    ) {
        let mut store = ByteRangeStore::with_data();
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&mut store, &mut model, op);
        }
        store.delete(start, len).unwrap();

        let end = start + len as u64;
        for (&addr, &byte) in model.iter().filter(|(a, _)| **a < start || **a >= end) {
            prop_assert_eq!(store.read(addr, 1).unwrap(), &[byte][..]);
        }
        for addr in start..end {
            prop_assert!(!store.contains(addr, 1));
            prop_assert!(store.read(addr, 1).is_err());
        }
    }

    /// Span-only stores track exactly the same spans as data stores.
    #[test]
    fn span_store_matches_data_store(ops in proptest::collection::vec(range_op(), 1..30)) {
        let mut spans = ByteRangeStore::without_data();
        let mut data = ByteRangeStore::with_data();
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&mut data, &mut model, op);
            match op {
                RangeOp::Write(a, d) => spans.add_empty(*a, d.len()).unwrap(),
                RangeOp::AddEmpty(a, n) => spans.add_empty(*a, *n).unwrap(),
                RangeOp::Delete(a, n) => spans.delete(*a, *n).unwrap(),
            }
        }
        let a: Vec<_> = spans.ranges().map(|r| (r.start, r.len)).collect();
        let b: Vec<_> = data.ranges().map(|r| (r.start, r.len)).collect();
        prop_assert_eq!(a, b);
    }
}

// ── Aliases ───────────────────────────────────────────────────

proptest! {
    /// Inside the limits, user → device → user returns the original value.
    #[test]
    fn alias_round_trip_inside_limits(
        gain in prop_oneof![-1000.0f64..-0.001, 0.001f64..1000.0],
        offset in -1000.0f64..1000.0,
        v in -500.0f64..500.0,
    ) {
        let alias = AliasDef::new(dummy_target()).with_gain(gain).with_offset(offset).with_limits(-500.0, 500.0);
        let back = alias.device_to_user(alias.user_to_device(v));
        prop_assert!((back - v).abs() <= 1e-9 * v.abs().max(1.0) * gain.abs().max(1.0 / gain.abs()));
    }

    /// Outside the limits, the value is clamped before inversion.
    #[test]
    fn alias_clamps_before_inverting(
        gain in 0.01f64..100.0,
        offset in -100.0f64..100.0,
        excess in 0.001f64..1e6,
    ) {
        let alias = AliasDef::new(dummy_target()).with_gain(gain).with_offset(offset).with_limits(-10.0, 10.0);
        prop_assert_eq!(alias.user_to_device(10.0 + excess), alias.user_to_device(10.0));
        prop_assert_eq!(alias.user_to_device(-10.0 - excess), alias.user_to_device(-10.0));
    }
}

fn dummy_target() -> memsync::datastore::EntryId {
    let mut store = ValueStore::default();
    store
        .add_variable("/t", VariableDef::new(0, EmbeddedDataType::Float64, Endianness::Little))
        .unwrap()
}

// ── Wire helpers ──────────────────────────────────────────────

proptest! {
    /// The heartbeat answer carries the one's complement of the challenge.
    #[test]
    fn heartbeat_complements_challenge(session in any::<u32>(), challenge in any::<u16>()) {
        let codec = ProtocolCodec::default();
        let request = codec.comm_heartbeat(session, challenge);
        let response = codec.respond_heartbeat(&request, session, challenge);
        prop_assert_eq!(
            codec.parse_response(&request, &response).unwrap(),
            ResponseData::Heartbeat { session_id: session, challenge_response: !challenge }
        );
    }

    /// However a byte stream is split, the decoder yields the same frames.
    #[test]
    fn frame_decoder_ignores_read_boundaries(
        payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..40), 1..6),
        cuts in proptest::collection::vec(1usize..16, 1..32),
    ) {
        let codec = ProtocolCodec::default();
        let stream: Vec<u8> = payloads
            .iter()
            .flat_map(|p| codec.user_command(1, p.clone()).to_bytes().unwrap())
            .collect();

        let mut decoder = FrameDecoder::new(FrameKind::Request, 64);
        let mut frames = Vec::new();
        let mut rest = stream.as_slice();
        for cut in cuts.iter().cycle() {
            if rest.is_empty() {
                break;
            }
            let (head, tail) = rest.split_at((*cut).min(rest.len()));
            decoder.feed(head);
            rest = tail;
            while let Some(frame) = decoder.next_frame() {
                frames.push(Request::from_bytes(&frame.unwrap()).unwrap().payload);
            }
        }
        prop_assert_eq!(frames, payloads);
    }

    /// Integers that fit their type survive encoding in either byte order.
    #[test]
    fn in_range_integers_survive_encoding(v in any::<i16>(), big in any::<bool>()) {
        let endianness = if big { Endianness::Big } else { Endianness::Little };
        let bytes = encode_value(EmbeddedDataType::Sint16, endianness, Value::Int(i64::from(v))).unwrap();
        prop_assert_eq!(bytes.len(), 2);
        prop_assert_eq!(
            decode_value(EmbeddedDataType::Sint16, endianness, &bytes).unwrap(),
            Value::Int(i64::from(v))
        );
    }
}
