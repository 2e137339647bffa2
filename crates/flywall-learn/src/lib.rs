//! Flywall learn - the learning/offload controller
//!
//! Observes new flows from the userspace queue, assigns verdicts via
//! the decision engine, and promotes flows that survive the inspection
//! window to the kernel bypass.

#![warn(clippy::all)]

pub mod controller;
pub mod reaper;
pub mod signature;

pub use controller::{ControllerStats, LearnController, QueueVerdict};
pub use reaper::{spawn_reaper, REAPER_INTERVAL};
pub use signature::{Signature, SignatureKind, SignatureMeta, SignatureSet};
