//! Evidence collectors managed uniformly by the pipeline. Both modules
//! honor the same contract: `start` at most once per run, `stop` is a
//! no-op unless the module actually started and otherwise flushes
//! whatever artifacts exist, even on partial failure.

use crate::script::HookScriptGenerator;
use crate::session::{Deadline, InstrumentationSession};
use async_trait::async_trait;
use cage_adb::DeviceTransport;
use cage_core::hooks::HookDefinition;
use cage_core::{ApiEvent, CageError, Result, ScriptMessage};
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// On-device locations of the packet-capture helper and its outputs.
pub const CAPTURE_HELPER_PATH: &str = "/data/local/tmp/tcpdump";
pub const CAPTURE_DUMP_PATH: &str = "/data/local/tmp/tcpdump.pcap";
pub const CAPTURE_LOG_PATH: &str = "/data/local/tmp/tcpdump.log";

/// Uniform start/stop/isRunning surface over heterogeneous collectors.
#[async_trait]
pub trait MonitorModule: Send {
    fn description(&self) -> &'static str;
    fn pid(&self) -> Option<u32>;
    fn is_running(&self) -> bool;
    async fn start(&mut self) -> Result<()>;
    async fn stop(&mut self) -> Result<()>;
}

/// Captures Java API calls: compiles the configured hooks, loads them into
/// the target through the shared instrumentation session, and appends each
/// delivered event to the task's event log (hook failures go to a separate
/// error log).
pub struct ApiMonitor {
    session: Arc<Mutex<InstrumentationSession>>,
    definitions: Vec<HookDefinition>,
    events_path: PathBuf,
    errors_path: PathBuf,
    call_budget: Duration,
    running: bool,
    started_once: bool,
    pid: Option<u32>,
    drain: Option<JoinHandle<()>>,
}

impl ApiMonitor {
    pub fn new(
        session: Arc<Mutex<InstrumentationSession>>,
        definitions: Vec<HookDefinition>,
        events_path: PathBuf,
        errors_path: PathBuf,
        call_budget: Duration,
    ) -> Self {
        Self {
            session,
            definitions,
            events_path,
            errors_path,
            call_budget,
            running: false,
            started_once: false,
            pid: None,
            drain: None,
        }
    }

    fn open_log(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| {
                CageError::module(
                    "API monitoring",
                    format!("cannot open {}: {err}", path.display()),
                )
            })
    }

    fn module_err(err: CageError) -> CageError {
        // Deadline expiry is handled like any other session failure here.
        CageError::module("API monitoring", err.to_string())
    }
}

#[async_trait]
impl MonitorModule for ApiMonitor {
    fn description(&self) -> &'static str {
        "API monitoring"
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_running(&self) -> bool {
        self.running
    }

    async fn start(&mut self) -> Result<()> {
        if self.started_once {
            return Err(CageError::module(
                self.description(),
                "started twice in one run",
            ));
        }
        self.started_once = true;

        let script = HookScriptGenerator::new()
            .compile(&self.definitions)
            .map_err(Self::module_err)?;

        let mut events_log = Self::open_log(&self.events_path)?;
        let mut errors_log = Self::open_log(&self.errors_path)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<ScriptMessage>();
        let drain = tokio::spawn(async move {
            let mut seq = 0u64;
            while let Some(message) = rx.recv().await {
                match message {
                    ScriptMessage::Event(payload) => {
                        let event = ApiEvent::from_payload(seq, &payload);
                        seq += 1;
                        match serde_json::to_string(&event) {
                            Ok(line) => {
                                if let Err(err) = writeln!(events_log, "{line}") {
                                    warn!(%err, "event log write failed");
                                }
                            }
                            Err(err) => warn!(%err, "unserializable event dropped"),
                        }
                    }
                    ScriptMessage::Error { description, stack } => {
                        let line = json!({ "description": description, "stack": stack });
                        if let Err(err) = writeln!(errors_log, "{line}") {
                            warn!(%err, "error log write failed");
                        }
                    }
                }
            }
        });
        self.drain = Some(drain);

        let mut session = self.session.lock().await;
        let attach_result = async {
            session.attach(Deadline::new(self.call_budget)).await?;
            session
                .load_script(script.source(), tx, Deadline::new(self.call_budget))
                .await
        }
        .await;

        if let Err(err) = attach_result {
            let _ = session.terminate();
            return Err(Self::module_err(err));
        }

        self.pid = session.pid();
        self.running = true;
        debug!(hooks = script.hook_count(), "API monitoring started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;

        {
            let mut session = self.session.lock().await;
            session.terminate().map_err(Self::module_err)?;
        }

        // The backend dropped its message sender on unload; the drain task
        // finishes writing whatever was still queued, then exits.
        if let Some(drain) = self.drain.take() {
            if let Err(err) = drain.await {
                warn!(%err, "event drain task failed");
            }
        }

        debug!("API monitoring stopped");
        Ok(())
    }
}

/// Captures network traffic through the on-device helper: a raw pcap plus
/// a readable log, both pulled into the task workspace on stop.
pub struct NetworkMonitor {
    transport: Arc<DeviceTransport>,
    pcap_out: PathBuf,
    net_log_out: PathBuf,
    pid: Option<u32>,
    running: bool,
    started_once: bool,
}

impl NetworkMonitor {
    pub fn new(transport: Arc<DeviceTransport>, pcap_out: PathBuf, net_log_out: PathBuf) -> Self {
        Self {
            transport,
            pcap_out,
            net_log_out,
            pid: None,
            running: false,
            started_once: false,
        }
    }
}

#[async_trait]
impl MonitorModule for NetworkMonitor {
    fn description(&self) -> &'static str {
        "network capture"
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_running(&self) -> bool {
        self.running
    }

    async fn start(&mut self) -> Result<()> {
        if self.started_once {
            return Err(CageError::module(
                self.description(),
                "started twice in one run",
            ));
        }
        self.started_once = true;

        info!("starting network capture on the device");
        // One shell invocation: `$!` only means anything in the shell that
        // launched the background job.
        let output = self
            .transport
            .shell(&[
                CAPTURE_HELPER_PATH,
                "-nnqUs",
                "0",
                "-w",
                CAPTURE_DUMP_PATH,
                ">/dev/null",
                "2>&1",
                "&",
                "echo",
                "$!",
            ])
            .await
            .map_err(|err| CageError::module(self.description(), err.to_string()))?;

        let pid = output
            .as_deref()
            .and_then(|stdout| stdout.trim().parse::<u32>().ok())
            .ok_or_else(|| {
                CageError::module(self.description(), "helper did not report a pid")
            })?;

        self.pid = Some(pid);
        self.running = true;
        debug!(pid, "network capture running");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;

        let mut first_failure: Option<CageError> = None;
        let mut note = |err: CageError| {
            error!(%err, "network capture teardown step failed");
            if first_failure.is_none() {
                first_failure = Some(err);
            }
        };

        if let Some(pid) = self.pid.take() {
            if let Err(err) = self.transport.kill_process(pid).await {
                note(err);
            }
        }

        if let Err(err) = self
            .transport
            .shell(&[
                CAPTURE_HELPER_PATH,
                "-ttttnnql",
                "-r",
                CAPTURE_DUMP_PATH,
                ">",
                CAPTURE_LOG_PATH,
            ])
            .await
        {
            note(err);
        }

        // Pull whatever exists even when earlier steps failed.
        if let Err(err) = self.transport.pull(CAPTURE_DUMP_PATH, &self.pcap_out).await {
            note(err);
        }
        if let Err(err) = self.transport.pull(CAPTURE_LOG_PATH, &self.net_log_out).await {
            note(err);
        }

        match first_failure {
            None => {
                debug!("network capture stopped");
                Ok(())
            }
            Some(err) => Err(CageError::module(self.description(), err.to_string())),
        }
    }
}
