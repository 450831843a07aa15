//! Sparse byte-range map with merge-on-write and split-on-delete.
//!
//! ```text
//!   write(0x10, 4)   write(0x14, 2)   delete(0x11, 2)
//!   [10..14)     →   [10..16)     →   [10..11) [13..16)
//! ```
//!
//! Invariant held before and after every call: stored ranges are sorted
//! by start address, never overlap and never touch.  An insertion
//! therefore only has to look at one neighbour on each side.
//!
//! The reader uses one store without data to plan how watched variables
//! agglomerate into blocks, and one store with data to reassemble a
//! read response so every entry can slice its own window.

use std::collections::BTreeMap;

use crate::error::RangeError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Span {
    len: usize,
    /// Empty when the store does not retain data.
    data: Vec<u8>,
}

/// One contiguous stored range, borrowed from a [`ByteRangeStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange<'a> {
    pub start: u64,
    pub len: usize,
    /// `None` for stores that only track spans.
    pub data: Option<&'a [u8]>,
}

impl ByteRange<'_> {
    /// First address past the range.
    pub fn end(&self) -> u64 {
        self.start + self.len as u64
    }
}

/// Ordered, non-overlapping, non-adjacent set of byte ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRangeStore {
    retain_data: bool,
    ranges: BTreeMap<u64, Span>,
}

fn span_end(start: u64, len: usize) -> Result<u64, RangeError> {
    if len == 0 {
        return Err(RangeError::ZeroLength);
    }
    start
        .checked_add(len as u64)
        .ok_or(RangeError::AddressOverflow)
}

impl ByteRangeStore {
    /// A store that holds the bytes of every range.
    pub fn with_data() -> Self {
        Self {
            retain_data: true,
            ranges: BTreeMap::new(),
        }
    }

    /// A store that only tracks which spans exist.
    pub fn without_data() -> Self {
        Self {
            retain_data: false,
            ranges: BTreeMap::new(),
        }
    }

    pub fn retains_data(&self) -> bool {
        self.retain_data
    }

    /// Store `data` at `address`, replacing whatever overlapped it.
    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<(), RangeError> {
        self.insert(address, data.len(), Some(data))
    }

    /// Mark `[address, address + len)` as present.  A data-retaining
    /// store fills the span with zeros.
    pub fn add_empty(&mut self, address: u64, len: usize) -> Result<(), RangeError> {
        self.insert(address, len, None)
    }

    fn insert(&mut self, start: u64, len: usize, data: Option<&[u8]>) -> Result<(), RangeError> {
        let end = span_end(start, len)?;
        self.delete(start, len)?;

        let left_key = self
            .ranges
            .range(..start)
            .next_back()
            .filter(|(k, s)| **k + s.len as u64 == start)
            .map(|(k, _)| *k);

        let (merged_start, mut merged_len, mut bytes) =
            match left_key.and_then(|k| self.ranges.remove(&k).map(|s| (k, s))) {
                Some((k, span)) => (k, span.len, span.data),
                None => (start, 0, Vec::new()),
            };

        merged_len += len;
        if self.retain_data {
            match data {
                Some(d) => bytes.extend_from_slice(d),
                None => bytes.resize(bytes.len() + len, 0),
            }
        }

        if let Some(right) = self.ranges.remove(&end) {
            merged_len += right.len;
            bytes.extend_from_slice(&right.data);
        }

        self.ranges.insert(
            merged_start,
            Span {
                len: merged_len,
                data: bytes,
            },
        );
        Ok(())
    }

    /// Remove `[address, address + len)` from every range it overlaps.
    pub fn delete(&mut self, address: u64, len: usize) -> Result<(), RangeError> {
        let end = span_end(address, len)?;

        let mut touched: Vec<u64> = Vec::new();
        if let Some((&k, s)) = self.ranges.range(..address).next_back() {
            if k + s.len as u64 > address {
                touched.push(k);
            }
        }
        touched.extend(self.ranges.range(address..end).map(|(k, _)| *k));

        for key in touched {
            let Some(span) = self.ranges.remove(&key) else {
                continue;
            };
            let span_end = key + span.len as u64;

            match (key < address, span_end > end) {
                // Fully covered: dropped.
                (false, false) => {}
                // Left edge trimmed: shrink and relocate start.
                (false, true) => {
                    let cut = (end - key) as usize;
                    let mut data = span.data;
                    if self.retain_data {
                        data.drain(..cut);
                    }
                    self.ranges.insert(
                        end,
                        Span {
                            len: span.len - cut,
                            data,
                        },
                    );
                }
                // Right edge trimmed: shrink in place.
                (true, false) => {
                    let keep = (address - key) as usize;
                    let mut data = span.data;
                    data.truncate(keep);
                    self.ranges.insert(key, Span { len: keep, data });
                }
                // Strictly inside: split around the gap.
                (true, true) => {
                    let keep = (address - key) as usize;
                    let cut = (end - key) as usize;
                    let (left, right) = if self.retain_data {
                        (span.data[..keep].to_vec(), span.data[cut..].to_vec())
                    } else {
                        (Vec::new(), Vec::new())
                    };
                    self.ranges.insert(key, Span { len: keep, data: left });
                    self.ranges.insert(
                        end,
                        Span {
                            len: span.len - cut,
                            data: right,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Borrow `len` bytes at `address`.  The window must lie inside a
    /// single stored range; short reads are not supported.
    pub fn read(&self, address: u64, len: usize) -> Result<&[u8], RangeError> {
        if !self.retain_data {
            return Err(RangeError::NoData);
        }
        let (start, span) = self.containing(address, len)?;
        let offset = (address - start) as usize;
        Ok(&span.data[offset..offset + len])
    }

    /// True when `[address, address + len)` lies inside one stored range.
    pub fn contains(&self, address: u64, len: usize) -> bool {
        self.containing(address, len).is_ok()
    }

    fn containing(&self, address: u64, len: usize) -> Result<(u64, &Span), RangeError> {
        let end = span_end(address, len)?;
        let not_contained = RangeError::NotContained { address, len };
        let (&start, span) = self.ranges.range(..=address).next_back().ok_or(not_contained)?;
        if start + span.len as u64 >= end {
            Ok((start, span))
        } else {
            Err(not_contained)
        }
    }

    /// Stored ranges in ascending address order.
    pub fn ranges(&self) -> impl Iterator<Item = ByteRange<'_>> {
        let retain = self.retain_data;
        self.ranges.iter().map(move |(&start, span)| ByteRange {
            start,
            len: span.len,
            data: retain.then_some(span.data.as_slice()),
        })
    }

    /// Number of stored (merged) ranges.
    pub fn block_count(&self) -> usize {
        self.ranges.len()
    }

    /// Sum of all range lengths.
    pub fn total_len(&self) -> usize {
        self.ranges.values().map(|s| s.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(store: &ByteRangeStore) -> Vec<(u64, usize)> {
        store.ranges().map(|r| (r.start, r.len)).collect()
    }

    #[test]
    fn adjacent_writes_merge() {
        let mut s = ByteRangeStore::with_data();
        s.write(0x10, &[1, 2, 3, 4]).unwrap();
        s.write(0x14, &[5, 6]).unwrap();
        s.write(0x0E, &[7, 8]).unwrap();
        assert_eq!(spans(&s), vec![(0x0E, 8)]);
        assert_eq!(s.read(0x0E, 8).unwrap(), &[7, 8, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn write_bridges_two_ranges() {
        let mut s = ByteRangeStore::with_data();
        s.write(0, &[1, 1]).unwrap();
        s.write(4, &[3, 3]).unwrap();
        s.write(2, &[2, 2]).unwrap();
        assert_eq!(spans(&s), vec![(0, 6)]);
        assert_eq!(s.read(0, 6).unwrap(), &[1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn overlapping_write_replaces_bytes() {
        let mut s = ByteRangeStore::with_data();
        s.write(0, &[0; 8]).unwrap();
        s.write(2, &[9, 9, 9]).unwrap();
        assert_eq!(spans(&s), vec![(0, 8)]);
        assert_eq!(s.read(0, 8).unwrap(), &[0, 0, 9, 9, 9, 0, 0, 0]);
    }

    #[test]
    fn delete_full_cover() {
        let mut s = ByteRangeStore::with_data();
        s.write(0x10, &[1, 2]).unwrap();
        s.write(0x20, &[3, 4]).unwrap();
        s.delete(0x0F, 4).unwrap();
        assert_eq!(spans(&s), vec![(0x20, 2)]);
    }

    #[test]
    fn delete_left_edge() {
        let mut s = ByteRangeStore::with_data();
        s.write(0x10, &[1, 2, 3, 4]).unwrap();
        s.delete(0x0E, 4).unwrap();
        assert_eq!(spans(&s), vec![(0x12, 2)]);
        assert_eq!(s.read(0x12, 2).unwrap(), &[3, 4]);
    }

    #[test]
    fn delete_right_edge() {
        let mut s = ByteRangeStore::with_data();
        s.write(0x10, &[1, 2, 3, 4]).unwrap();
        s.delete(0x12, 10).unwrap();
        assert_eq!(spans(&s), vec![(0x10, 2)]);
        assert_eq!(s.read(0x10, 2).unwrap(), &[1, 2]);
    }

    #[test]
    fn delete_inside_splits() {
        let mut s = ByteRangeStore::with_data();
        s.write(0x10, &[1, 2, 3, 4, 5]).unwrap();
        s.delete(0x11, 2).unwrap();
        assert_eq!(spans(&s), vec![(0x10, 1), (0x13, 2)]);
        assert_eq!(s.read(0x13, 2).unwrap(), &[4, 5]);
        assert!(s.read(0x11, 1).is_err());
    }

    #[test]
    fn read_across_gap_fails() {
        let mut s = ByteRangeStore::with_data();
        s.write(0, &[1, 2]).unwrap();
        s.write(3, &[4]).unwrap();
        assert_eq!(
            s.read(1, 3),
            Err(RangeError::NotContained { address: 1, len: 3 })
        );
        assert!(s.read(0, 3).is_err());
        assert_eq!(s.read(1, 1).unwrap(), &[2]);
    }

    #[test]
    fn read_before_first_range_fails() {
        let mut s = ByteRangeStore::with_data();
        s.write(0x100, &[1]).unwrap();
        assert!(s.read(0x50, 1).is_err());
    }

    #[test]
    fn spans_only_store() {
        let mut s = ByteRangeStore::without_data();
        s.add_empty(0x1000, 4).unwrap();
        s.add_empty(0x1004, 4).unwrap();
        s.add_empty(0x1010, 4).unwrap();
        assert_eq!(s.block_count(), 2);
        assert_eq!(s.total_len(), 12);
        assert!(s.contains(0x1002, 4));
        assert_eq!(s.read(0x1000, 4), Err(RangeError::NoData));
        assert!(s.ranges().all(|r| r.data.is_none()));
    }

    #[test]
    fn add_empty_zero_fills_when_retaining() {
        let mut s = ByteRangeStore::with_data();
        s.add_empty(8, 3).unwrap();
        assert_eq!(s.read(8, 3).unwrap(), &[0, 0, 0]);
    }

    #[test]
    fn zero_length_and_overflow_rejected() {
        let mut s = ByteRangeStore::with_data();
        assert_eq!(s.write(0, &[]), Err(RangeError::ZeroLength));
        assert_eq!(s.add_empty(u64::MAX, 2), Err(RangeError::AddressOverflow));
        assert!(s.is_empty());
    }
}
