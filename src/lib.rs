//! memsync: host-side memory synchronization core for embedded live
//! debugging.
//!
//! Keeps a store of device values (memory variables, runtime published
//! values and their aliases) in step with a target over a half-duplex,
//! request/response link.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ adapters: ChannelLink · EmulatedDevice      (Link port)      │
//! │ ─────────────────── Port Trait Boundary ──────────────────── │
//! │ app::SyncService                                             │
//! │   sync::{MemoryReader, MemoryWriter} ─▶ dispatch::Dispatcher │
//! │   datastore::ValueStore                                      │
//! │ protocol (codec, framing) · memory (ranges, regions)         │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod datastore;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod sync;
