//! Flywall common - shared types for the firewall core
//!
//! This crate provides the primitives every other core crate builds on:
//! - Error model with kinds and attributes
//! - Platform record (clock, node identity, shutdown fan-out)
//! - Flow identity and shared flow state
//! - Packet record and configuration model

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod flow;
pub mod packet;
pub mod platform;

pub use config::*;
pub use error::{Error, Kind, Result};
pub use flow::*;
pub use packet::*;
pub use platform::*;
