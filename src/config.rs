//! Synchronization engine configuration.
//!
//! Tunables for the scheduling core, plus the device description used
//! until a real device has been queried.  Loaded from JSON by the
//! simulator.

use serde::{Deserialize, Serialize};

use crate::datastore::MAX_PENDING_WRITES;
use crate::error::Error;
use crate::memory::RegionMap;
use crate::protocol::DeviceParams;

/// Core engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    // --- Dispatch ---
    /// How long a request may stay unanswered (microseconds)
    pub request_timeout_us: u64,

    // --- Queues ---
    /// Queued writes allowed per entry (1..=32)
    pub write_queue_depth: usize,
    /// Raw reads, and separately raw writes, allowed in the queue
    pub raw_queue_depth: usize,
    /// Largest single raw read, in bytes
    pub max_raw_read_size: usize,

    // --- Timing ---
    /// Interval between `process()` calls in the simulator (milliseconds)
    pub tick_interval_ms: u32,

    // --- Device ---
    /// Link parameters assumed before the device reports its own
    pub device: DeviceParams,
    /// Protected regions assumed before the device reports its own
    pub regions: RegionMap,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout_us: 200_000, // 200 ms
            write_queue_depth: 16,
            raw_queue_depth: 8,
            max_raw_read_size: 64 * 1024,
            tick_interval_ms: 5,
            device: DeviceParams::default(),
            regions: RegionMap::default(),
        }
    }
}

impl SyncConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.request_timeout_us == 0 {
            return Err(Error::Config("request timeout must be non-zero"));
        }
        if self.write_queue_depth == 0 || self.write_queue_depth > MAX_PENDING_WRITES {
            return Err(Error::Config("write queue depth must be within 1..=32"));
        }
        if self.raw_queue_depth == 0 {
            return Err(Error::Config("raw queue depth must be non-zero"));
        }
        if self.max_raw_read_size == 0 {
            return Err(Error::Config("raw read limit must be non-zero"));
        }
        if self.device.max_rx_data_size == 0 || self.device.max_tx_data_size == 0 {
            return Err(Error::Config("device payload sizes must be non-zero"));
        }
        Ok(())
    }
}
