//! Pipeline stages and reports

use std::sync::Arc;

use chrono::{DateTime, Utc};
use flywall_common::{Config, Result};
use flywall_kernel::Ruleset;
use flywall_policy::CompiledPolicy;
use serde::Serialize;

/// Mutable state threaded through the stages.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub candidate: Config,
    pub compiled: Option<Arc<CompiledPolicy>>,
    pub ruleset: Option<Ruleset>,
    pub warnings: Vec<String>,
}

impl PipelineContext {
    pub fn new(candidate: Config) -> Self {
        Self {
            candidate,
            compiled: None,
            ruleset: None,
            warnings: Vec::new(),
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

pub type StageFn = Box<dyn Fn(&mut PipelineContext) -> Result<()> + Send + Sync>;

/// One stage: any of validator, transformer, executor, run in that
/// order. A non-optional failure aborts the pipeline; an optional
/// failure registers a warning and leaves the candidate unchanged.
pub struct Stage {
    pub name: &'static str,
    pub optional: bool,
    pub validator: Option<StageFn>,
    pub transformer: Option<StageFn>,
    pub executor: Option<StageFn>,
}

impl Stage {
    pub fn validator(name: &'static str, f: StageFn) -> Self {
        Self {
            name,
            optional: false,
            validator: Some(f),
            transformer: None,
            executor: None,
        }
    }

    pub fn transformer(name: &'static str, f: StageFn) -> Self {
        Self {
            name,
            optional: false,
            validator: None,
            transformer: Some(f),
            executor: None,
        }
    }

    pub fn executor(name: &'static str, f: StageFn) -> Self {
        Self {
            name,
            optional: false,
            validator: None,
            transformer: None,
            executor: Some(f),
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub(crate) fn run(&self, ctx: &mut PipelineContext) -> Result<()> {
        for f in [&self.validator, &self.transformer, &self.executor]
            .into_iter()
            .flatten()
        {
            f(ctx)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("optional", &self.optional)
            .finish_non_exhaustive()
    }
}

/// How one stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    Passed,
    Warned,
    Failed,
}

/// Operator-facing record for one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    pub outcome: StageOutcome,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

/// Per-run summary with error and warning counts.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
    pub errors: usize,
    pub warnings: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineReport {
    pub fn ok(&self) -> bool {
        self.errors == 0
    }

    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        format!(
            "{} stages, {} errors, {} warnings",
            self.stages.len(),
            self.errors,
            self.warnings
        )
    }
}
