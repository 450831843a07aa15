//! Fuzz target: `ByteRangeStore`
//!
//! Interprets the input as a sequence of write / add-empty / delete
//! operations and checks after each one that the stored ranges stay
//! sorted, disjoint and non-adjacent.
//!
//! cargo fuzz run fuzz_range_store

#![no_main]

use libfuzzer_sys::fuzz_target;
use memsync::memory::ByteRangeStore;

fuzz_target!(|data: &[u8]| {
    let mut store = ByteRangeStore::with_data();
    for op in data.chunks_exact(3) {
        let address = u64::from(op[1]);
        let len = usize::from(op[2] % 32);
        let result = match op[0] % 3 {
            0 => store.write(address, &vec![op[2]; len]),
            1 => store.add_empty(address, len),
            _ => store.delete(address, len),
        };
        assert_eq!(result.is_err(), len == 0);

        let mut prev_end = None;
        for range in store.ranges() {
            assert!(range.len > 0);
            if let Some(end) = prev_end {
                assert!(range.start > end, "ranges overlap or touch");
            }
            assert!(store.read(range.start, range.len).is_ok());
            prev_end = Some(range.end());
        }
    }
});
