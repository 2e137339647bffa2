//! Flywall policy - zone resolution and rule evaluation
//!
//! The compiled policy is built once per config commit; the engine
//! evaluates packets against it on the hot path without blocking.

#![warn(clippy::all)]

pub mod compile;
pub mod engine;

pub use compile::{compile, CompiledBlock, CompiledPolicy, CompiledRule, IpMatch};
pub use engine::{Decision, DecisionEngine, EngineStats, RULE_DEFAULT_DROP, RULE_UNKNOWN_ZONE};
