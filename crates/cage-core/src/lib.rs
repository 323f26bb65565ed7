pub mod error;
pub mod event;
pub mod hooks;
pub mod identity;
pub mod phase;
pub mod task;

pub use error::CageError;
pub use event::{ApiEvent, ScriptMessage};
pub use hooks::HookDefinition;
pub use phase::{PhaseEvent, PipelinePhase};
pub use task::AnalysisTask;

pub type Result<T> = std::result::Result<T, CageError>;
