//! Thread-crossing link.
//!
//! Uses `embassy-sync` bounded channels to bridge a transport thread
//! (serial port, socket, emulator) with the single-threaded sync core.
//! Bytes travel in fixed-capacity chunks; frame boundaries are not
//! preserved, the frame decoders on both ends take care of that.
//!
//! ```text
//! ┌──────────────┐  to_device   ┌────────────────┐
//! │  SyncService │─────────────▶│ transport task │
//! │ (ChannelLink)│◀─────────────│ (TransportEnd) │
//! └──────────────┘  from_device └────────────────┘
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use heapless::Vec as ChunkVec;
use log::warn;

use crate::app::ports::{Link, LinkError};

/// Bytes per channel message.
pub const CHUNK_SIZE: usize = 256;

/// Messages buffered in each direction.
const CHANNEL_DEPTH: usize = 16;

type Chunk = ChunkVec<u8, CHUNK_SIZE>;
type ByteChannel = Channel<CriticalSectionRawMutex, Chunk, CHANNEL_DEPTH>;

struct Shared {
    to_device: ByteChannel,
    from_device: ByteChannel,
    up: AtomicBool,
}

/// Create a connected pair: the core's [`ChannelLink`] and the
/// transport thread's [`TransportEnd`].  The link starts up.
pub fn channel_link() -> (ChannelLink, TransportEnd) {
    let shared = Arc::new(Shared {
        to_device: Channel::new(),
        from_device: Channel::new(),
        up: AtomicBool::new(true),
    });
    (
        ChannelLink {
            shared: Arc::clone(&shared),
        },
        TransportEnd { shared },
    )
}

/// Push `bytes` as whole chunks, or nothing if they do not all fit.
fn push(channel: &ByteChannel, bytes: &[u8]) -> Result<(), LinkError> {
    let needed = bytes.len().div_ceil(CHUNK_SIZE);
    if needed > channel.free_capacity() {
        return Err(LinkError::Full);
    }
    for piece in bytes.chunks(CHUNK_SIZE) {
        let mut chunk = Chunk::new();
        chunk.extend_from_slice(piece).map_err(|()| LinkError::Io)?;
        channel.try_send(chunk).map_err(|_| LinkError::Full)?;
    }
    Ok(())
}

fn drain(channel: &ByteChannel) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    while let Ok(chunk) = channel.try_receive() {
        out.extend_from_slice(&chunk);
    }
    if out.is_empty() { None } else { Some(out) }
}

// ───────────────────────────────────────────────────────────────
// Core side
// ───────────────────────────────────────────────────────────────

pub struct ChannelLink {
    shared: Arc<Shared>,
}

impl Link for ChannelLink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.is_up() {
            return Err(LinkError::Down);
        }
        push(&self.shared.to_device, bytes)
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        drain(&self.shared.from_device)
    }

    fn is_up(&self) -> bool {
        self.shared.up.load(Ordering::Acquire)
    }
}

// ───────────────────────────────────────────────────────────────
// Transport side
// ───────────────────────────────────────────────────────────────

pub struct TransportEnd {
    shared: Arc<Shared>,
}

impl TransportEnd {
    /// Bytes the core has sent since the last call.
    pub fn take_outgoing(&self) -> Option<Vec<u8>> {
        drain(&self.shared.to_device)
    }

    /// Hand bytes received from the device to the core.
    pub fn deliver(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let result = push(&self.shared.from_device, bytes);
        if result.is_err() {
            warn!("Link: inbound channel full, dropping {} bytes", bytes.len());
        }
        result
    }

    /// Report the physical connection state.  Going down discards
    /// everything still in flight in either direction.
    pub fn set_up(&self, up: bool) {
        self.shared.up.store(up, Ordering::Release);
        if !up {
            self.shared.to_device.clear();
            self.shared.from_device.clear();
        }
    }

    pub fn is_up(&self) -> bool {
        self.shared.up.load(Ordering::Acquire)
    }
}
