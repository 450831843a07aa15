//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter        | Implements | Connects to                          |
//! |----------------|------------|--------------------------------------|
//! | `channel_link` | Link       | Transport thread via bounded channels|
//! | `emulator`     | Link       | In-process emulated device           |
//!
//! The `Clock` port is implemented by
//! [`MonotonicClock`](crate::app::ports::MonotonicClock).

pub mod channel_link;
pub mod emulator;

pub use channel_link::{CHUNK_SIZE, ChannelLink, TransportEnd, channel_link};
pub use emulator::EmulatedDevice;
