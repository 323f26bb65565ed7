//! The orchestrating state machine. Sequences staging, installation,
//! instrumentation, monitoring, interaction, and rollback, and is the only
//! place that decides abort-vs-continue for each phase.

use crate::apk::PackageResolver;
use crate::interact::InteractionDriver;
use crate::monitor::{ApiMonitor, MonitorModule, NetworkMonitor};
use crate::session::{Deadline, InstrumentationSession, SessionBackend};
use crate::staging::{stage_device, ServerFetcher, WipePolicy};
use cage_adb::DeviceTransport;
use cage_core::hooks::load_definitions;
use cage_core::{AnalysisTask, PhaseEvent, PipelinePhase, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root under which `task_<id>` workspaces are allocated.
    pub analyses_dir: PathBuf,
    /// The declarative hook-definitions file.
    pub hooks_file: PathBuf,
    pub wipe_policy: WipePolicy,
    /// How long the interaction collaborator gets.
    pub interaction_window: Duration,
    /// Per-call deadline for session operations.
    pub call_budget: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analyses_dir: PathBuf::from("analyses"),
            hooks_file: PathBuf::from("hooks/hooks_def.json"),
            wipe_policy: WipePolicy::Skip,
            interaction_window: Duration::from_secs(120),
            call_budget: Duration::from_secs(60),
        }
    }
}

pub struct AnalysisPipeline {
    transport: Arc<DeviceTransport>,
    session: Arc<Mutex<InstrumentationSession>>,
    fetcher: Arc<dyn ServerFetcher>,
    resolver: Arc<dyn PackageResolver>,
    driver: Arc<dyn InteractionDriver>,
    config: PipelineConfig,
    apk_path: PathBuf,
    active_modules: Vec<Box<dyn MonitorModule>>,
    phase_log: Vec<PhaseEvent>,
    task: Option<AnalysisTask>,
}

impl AnalysisPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<DeviceTransport>,
        backend: Box<dyn SessionBackend>,
        fetcher: Arc<dyn ServerFetcher>,
        resolver: Arc<dyn PackageResolver>,
        driver: Arc<dyn InteractionDriver>,
        apk_path: PathBuf,
        config: PipelineConfig,
    ) -> Self {
        Self {
            transport,
            session: Arc::new(Mutex::new(InstrumentationSession::new(backend))),
            fetcher,
            resolver,
            driver,
            config,
            apk_path,
            active_modules: Vec::new(),
            phase_log: Vec::new(),
            task: None,
        }
    }

    /// Steps completed so far, in order.
    pub fn phase_log(&self) -> &[PhaseEvent] {
        &self.phase_log
    }

    pub fn task(&self) -> Option<&AnalysisTask> {
        self.task.as_ref()
    }

    fn push(&mut self, event: PhaseEvent) {
        self.phase_log.push(event);
    }

    /// Run one analysis to completion. The device is restored from the
    /// backup taken up front whenever that backup exists, no matter which
    /// later step failed; a failure before the backup completes restores
    /// nothing.
    pub async fn run(&mut self) -> Result<()> {
        self.transport.check_connectivity().await?;
        self.push(PhaseEvent::ConnectivityOk);

        let mut task = AnalysisTask::allocate(&self.config.analyses_dir, &self.apk_path)?;
        info!(task = task.id, apk = %task.apk_path.display(), "analysis started");

        let outcome = self.execute(&mut task).await;
        match &outcome {
            Ok(()) => {
                task.finalize(PipelinePhase::Done);
                info!(task = task.id, "analysis finished");
            }
            Err(err) => {
                task.finalize(PipelinePhase::Failed);
                error!(task = task.id, %err, "analysis failed");
            }
        }
        self.task = Some(task);
        outcome
    }

    async fn execute(&mut self, task: &mut AnalysisTask) -> Result<()> {
        // The rollback checkpoint. Nothing destructive may run before it.
        self.transport.backup(&task.backup_path()).await?;
        task.phase = PipelinePhase::BackedUp;
        self.push(PhaseEvent::BackupOk);

        let outcome = self.run_forward(task).await;

        // Monitors flush their artifacts before the device is rolled
        // back, on failure as well as on success.
        self.stop_monitors().await;
        self.restore(task).await;

        outcome
    }

    async fn run_forward(&mut self, task: &mut AnalysisTask) -> Result<()> {
        let staging = stage_device(
            self.transport.as_ref(),
            self.fetcher.as_ref(),
            self.config.wipe_policy,
        )
        .await?;
        info!(arch = %staging.arch, api_level = staging.api_level, "device staged");
        task.phase = PipelinePhase::Staged;
        self.push(PhaseEvent::StageOk);

        self.transport.install(&task.apk_path).await?;
        task.phase = PipelinePhase::Installed;
        self.push(PhaseEvent::InstallOk);

        let package = self.resolver.package_name(&task.apk_path).await?;
        let pid = self
            .session
            .lock()
            .await
            .spawn(&package, Deadline::new(self.config.call_budget))
            .await?;
        task.phase = PipelinePhase::Spawned;
        self.push(PhaseEvent::Spawned(pid));

        // The backend spawns the target suspended; it stays suspended
        // until the hooks are installed so no early call goes unseen.
        task.phase = PipelinePhase::Suspended;
        self.push(PhaseEvent::Suspended);

        self.start_monitors(task).await;
        task.phase = PipelinePhase::Monitoring;

        self.session.lock().await.resume().await?;
        self.push(PhaseEvent::Resumed);

        task.phase = PipelinePhase::Interacting;
        self.driver
            .interact(
                self.transport.as_ref(),
                &package,
                self.config.interaction_window,
            )
            .await?;
        self.push(PhaseEvent::Interacted);

        Ok(())
    }

    /// Bring up the monitoring modules. A module that fails to start is
    /// logged and excluded; its siblings are unaffected and the pipeline
    /// continues degraded.
    async fn start_monitors(&mut self, task: &mut AnalysisTask) {
        let mut modules: Vec<Box<dyn MonitorModule>> = Vec::new();

        match load_definitions(&self.config.hooks_file) {
            Ok(definitions) => modules.push(Box::new(ApiMonitor::new(
                Arc::clone(&self.session),
                definitions,
                task.api_events_path(),
                task.api_errors_path(),
                self.config.call_budget,
            ))),
            Err(err) => error!(%err, "API monitoring unavailable, continuing without it"),
        }
        modules.push(Box::new(NetworkMonitor::new(
            Arc::clone(&self.transport),
            task.pcap_path(),
            task.net_log_path(),
        )));

        for mut module in modules {
            let description = module.description();
            match module.start().await {
                Ok(()) => {
                    if description == "API monitoring" {
                        task.phase = PipelinePhase::Instrumented;
                    }
                    self.push(PhaseEvent::MonitorStarted(description.to_string()));
                    self.active_modules.push(module);
                }
                Err(err) => {
                    error!(module = description, %err, "module startup failed, excluded from this run");
                }
            }
        }
    }

    /// Stop every active module, pulling whatever artifacts exist. Stop
    /// failures cost evidence, not the run.
    async fn stop_monitors(&mut self) {
        let mut modules = std::mem::take(&mut self.active_modules);
        for module in &mut modules {
            let description = module.description();
            match module.stop().await {
                Ok(()) => self.push(PhaseEvent::MonitorStopped(description.to_string())),
                Err(err) => error!(
                    module = description,
                    %err,
                    "failed to finalize capture, some evidence may be missing"
                ),
            }
        }
    }

    /// The single restore attempt; its outcome is always logged and never
    /// retried.
    async fn restore(&mut self, task: &mut AnalysisTask) {
        task.phase = PipelinePhase::Restoring;
        match self.transport.restore(&task.backup_path()).await {
            Ok(()) => {
                info!("device state restored from backup");
                self.push(PhaseEvent::RestoreOk);
            }
            Err(err) => {
                error!(%err, "restore failed, device may be dirty");
                self.push(PhaseEvent::RestoreFailed);
            }
        }
    }
}
