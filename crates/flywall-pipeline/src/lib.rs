//! Flywall pipeline - staged configuration processing
//!
//! Validate → transform → dry-run → atomic apply. The pipeline's output
//! is the ruleset the datapath enforces; its mutations land in the
//! state store and replicate from there. The supervisor's safe-mode
//! gate sits in front of execution.

#![warn(clippy::all)]

pub mod apply;
pub mod compile;
pub mod export;
pub mod pipeline;
pub mod reload;
pub mod stage;
pub mod supervisor;

pub use apply::{Applier, ApplyReport, Service, BUCKET_CONFIG, KEY_RUNNING};
pub use compile::render_ruleset;
pub use export::export_running;
pub use pipeline::{standard_stages, ConfigPipeline};
pub use reload::{spawn_reload_listener, ConfigSource, ReloadHandle};
pub use stage::{PipelineContext, PipelineReport, Stage, StageOutcome, StageReport};
pub use supervisor::{
    classify, BootMode, ExitEvent, ExitKind, ExitStatus, Supervisor, BUCKET_SUPERVISOR,
    DEFAULT_CRASH_THRESHOLD, DEFAULT_WINDOW,
};
