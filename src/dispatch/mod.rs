//! Request arbitration over the half-duplex link.

pub mod dispatcher;
pub mod outcome;

pub use dispatcher::{
    Completion, DispatchStats, Dispatcher, Origin, PRIORITY_CONTROL, PRIORITY_READ, PRIORITY_WRITE,
};
pub use outcome::{OUTCOME_QUEUE_DEPTH, OutcomeQueue};
