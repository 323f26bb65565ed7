use std::fmt;

/// Where a pipeline run currently stands. Transitions are linear; any
/// failure after backup still passes through `Restoring` before the run
/// settles in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Init,
    BackedUp,
    Staged,
    Installed,
    Spawned,
    Suspended,
    Instrumented,
    Monitoring,
    Interacting,
    Restoring,
    Done,
    Failed,
}

impl PipelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePhase::Init => "init",
            PipelinePhase::BackedUp => "backed-up",
            PipelinePhase::Staged => "staged",
            PipelinePhase::Installed => "installed",
            PipelinePhase::Spawned => "spawned",
            PipelinePhase::Suspended => "suspended",
            PipelinePhase::Instrumented => "instrumented",
            PipelinePhase::Monitoring => "monitoring",
            PipelinePhase::Interacting => "interacting",
            PipelinePhase::Restoring => "restoring",
            PipelinePhase::Done => "done",
            PipelinePhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelinePhase::Done | PipelinePhase::Failed)
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed pipeline step, appended to the run's observable log as it
/// happens. Monitoring entries carry the module description so a degraded
/// run shows exactly which modules were active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    ConnectivityOk,
    BackupOk,
    StageOk,
    InstallOk,
    Spawned(u32),
    Suspended,
    MonitorStarted(String),
    Resumed,
    Interacted,
    MonitorStopped(String),
    RestoreOk,
    RestoreFailed,
}
