//! Device-declared special memory regions.
//!
//! Forbidden regions are off-limits to reads and writes; read-only
//! regions may be read but never written.  Both lists are reported by
//! the device and replaced wholesale when it reconnects.

use serde::{Deserialize, Serialize};

/// A half-open span `[start, start + size)` of device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub start: u64,
    pub size: u64,
}

impl MemoryRegion {
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// Build from the inclusive `[start, end]` pair used on the wire.
    pub fn from_inclusive(start: u64, end: u64) -> Option<Self> {
        if end < start {
            return None;
        }
        let size = (end - start).checked_add(1)?;
        Some(Self { start, size })
    }

    /// Last byte of the region (inclusive).
    pub fn last(&self) -> u64 {
        self.start.saturating_add(self.size.saturating_sub(1))
    }

    /// True when `[address, address + size)` shares at least one byte
    /// with this region.
    pub fn touches(&self, address: u64, size: u64) -> bool {
        if size == 0 || self.size == 0 {
            return false;
        }
        let last = address.saturating_add(size - 1);
        address <= self.last() && last >= self.start
    }
}

/// The forbidden and read-only region lists of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMap {
    pub forbidden: Vec<MemoryRegion>,
    pub readonly: Vec<MemoryRegion>,
}

impl RegionMap {
    pub fn new(forbidden: Vec<MemoryRegion>, readonly: Vec<MemoryRegion>) -> Self {
        Self {
            forbidden,
            readonly,
        }
    }

    pub fn is_forbidden(&self, address: u64, size: u64) -> bool {
        self.forbidden.iter().any(|r| r.touches(address, size))
    }

    pub fn is_readonly(&self, address: u64, size: u64) -> bool {
        self.readonly.iter().any(|r| r.touches(address, size))
    }

    pub fn is_readable(&self, address: u64, size: u64) -> bool {
        !self.is_forbidden(address, size)
    }

    pub fn is_writable(&self, address: u64, size: u64) -> bool {
        !self.is_forbidden(address, size) && !self.is_readonly(address, size)
    }
}
