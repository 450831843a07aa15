//! Host-side model of device memory: sparse byte ranges and the
//! device's protected regions.

pub mod range_store;
pub mod region;

pub use range_store::{ByteRange, ByteRangeStore};
pub use region::{MemoryRegion, RegionMap};
