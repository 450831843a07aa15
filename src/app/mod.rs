//! Application core: the sync service and the ports it drives.
//!
//! All interaction with the device link and with time happens through
//! the port traits in [`ports`], which keeps the service testable with
//! in-process adapters.

pub mod ports;
pub mod service;

pub use ports::{Clock, Link, LinkError, MonotonicClock, NullLink};
pub use service::{ControlOutcome, SyncService};
