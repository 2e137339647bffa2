//! Flywall store - replicated, tamper-evident state
//!
//! An append-only change log with a hash-chained version sequence atop
//! a single-file SQLite database, plus the counter/baseline bridge used
//! by external metrics collectors.

#![warn(clippy::all)]

pub mod baseline;
pub mod change;
pub mod store;

pub use baseline::{
    BaselineBridge, CumulativeCounter, InterfaceBaseline, PolicyBaseline, BUCKET_INTERFACE,
    BUCKET_POLICY,
};
pub use change::{Change, ChangeType, Entry, Snapshot};
pub use store::{ChangeStream, StateStore};
