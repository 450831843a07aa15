//! The read and write schedulers that keep the value store in step with
//! the device.
//!
//! Both expose a non-blocking `process()` called once per tick, emit at
//! most one request at a time, and learn the outcome through
//! `handle_completion()`.  "Waiting for a response" is state, never a
//! blocked call.

pub mod reader;
pub mod writer;

use crate::memory::RegionMap;
use crate::protocol::{DeviceParams, ProtocolCodec};

pub use reader::{MemoryReader, ReadCategory, ReaderStats};
pub use writer::{MemoryWriter, WriterStats};

/// What the schedulers know about the connected device: the payload
/// codec, the negotiated link limits and the protected regions.
#[derive(Debug, Clone, Default)]
pub struct DeviceModel {
    pub codec: ProtocolCodec,
    pub params: DeviceParams,
    pub regions: RegionMap,
}

impl DeviceModel {
    pub fn new(params: DeviceParams, regions: RegionMap) -> Self {
        Self {
            codec: ProtocolCodec::new(params.address_size),
            params,
            regions,
        }
    }

    /// Largest request payload the device accepts.
    pub fn max_request_payload(&self) -> usize {
        self.params.max_rx_data_size as usize
    }

    /// Largest response payload the device emits.
    pub fn max_response_payload(&self) -> usize {
        self.params.max_tx_data_size as usize
    }
}

/// Id of an ad hoc (raw) memory read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawRequestId(pub(crate) u64);

/// Result of a raw memory read: the whole buffer, or why it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReadOutcome {
    pub id: RawRequestId,
    pub address: u64,
    pub result: Result<Vec<u8>, String>,
}

/// Result of a raw memory write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawWriteOutcome {
    pub id: RawRequestId,
    pub address: u64,
    pub result: Result<(), String>,
}
