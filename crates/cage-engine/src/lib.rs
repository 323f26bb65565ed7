pub mod apk;
pub mod fetch;
#[cfg(feature = "frida")]
pub mod frida_backend;
pub mod interact;
pub mod monitor;
pub mod pipeline;
pub mod script;
pub mod session;
pub mod staging;

pub use apk::{AaptResolver, PackageResolver};
pub use fetch::DownloadFetcher;
pub use interact::{IdleDriver, InteractionDriver, MonkeyDriver};
pub use monitor::{ApiMonitor, MonitorModule, NetworkMonitor};
pub use pipeline::{AnalysisPipeline, PipelineConfig};
pub use script::{CompiledHookScript, HookScriptGenerator};
pub use session::{
    BackendFault, Deadline, InstrumentationSession, SessionBackend, SessionState,
};
pub use staging::{ServerFetcher, StagingContext, WipePolicy};
