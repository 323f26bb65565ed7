use std::time::Duration;
use thiserror::Error;

/// Error taxonomy for the whole sandbox. Components return these; the
/// pipeline is the only place that decides abort-vs-continue.
#[derive(Debug, Error)]
pub enum CageError {
    /// Device unreachable. Fatal to the whole run, nothing destructive may
    /// start after this is seen.
    #[error("device unreachable: {0}")]
    Connectivity(String),

    /// A device command exited non-zero or wrote to stderr.
    #[error("device command `{command}` failed: {detail}")]
    Command { command: String, detail: String },

    /// A required external binary or file is missing from the host.
    #[error("missing dependency `{tool}`: {detail}")]
    Dependency { tool: String, detail: String },

    /// Spawn/attach/script failure that exhausted its retry budget.
    #[error("instrumentation session: {0}")]
    Session(String),

    /// A monitoring module failed; isolated by the pipeline.
    #[error("monitoring module `{module}`: {detail}")]
    Module { module: String, detail: String },

    /// A caller-supplied deadline elapsed. Callers treat this like a
    /// session failure.
    #[error("`{operation}` exceeded its {budget:?} deadline")]
    Timeout { operation: String, budget: Duration },

    /// Device staging failed (architecture undetectable, dependency fetch
    /// failed, wipe aborted under the abort policy).
    #[error("device staging failed: {0}")]
    Startup(String),

    /// Hook-definition validation failed at compile time.
    #[error("hook script rejected: {0}")]
    Script(String),
}

impl CageError {
    pub fn command(command: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            detail: detail.into(),
        }
    }

    pub fn dependency(tool: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Dependency {
            tool: tool.into(),
            detail: detail.into(),
        }
    }

    pub fn module(module: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Module {
            module: module.into(),
            detail: detail.into(),
        }
    }

    /// True for the deadline-expiry case, which session callers fold into
    /// their own failure handling.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}
