//! Lifecycle of one instrumented target process: spawn suspended, attach,
//! load the compiled script, resume, tear down. The session owns the retry
//! policy; the backend only executes primitives and classifies faults.

use cage_core::{CageError, Result, ScriptMessage};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Retry ceilings. A transient fault past the ceiling escalates to a
/// fatal session error instead of looping.
pub const MAX_SPAWN_ATTEMPTS: u32 = 3;
pub const MAX_LOAD_ATTEMPTS: u32 = 3;

/// Wait before retrying while the backend reports another spawn in flight.
pub const BUSY_BACKOFF: Duration = Duration::from_secs(5);

/// Caller-supplied budget for one session call, checked cooperatively
/// between blocking steps. Expiry unwinds only the current call.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    /// Errors with `TimeoutError` once the budget is spent.
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.started.elapsed() >= self.budget {
            Err(CageError::Timeout {
                operation: operation.to_string(),
                budget: self.budget,
            })
        } else {
            Ok(())
        }
    }
}

/// Where the session currently stands. Exactly one script may be loaded at
/// a time; `Terminated` is reached only by killing the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Spawned(u32),
    Attached,
    ScriptLoaded,
    Terminated,
}

/// Classified backend failure. The session maps these onto its retry
/// policy; everything the policy does not recognize is fatal.
#[derive(Debug)]
pub enum BackendFault {
    /// The instrumentation server on the device is not answering.
    ServerUnreachable(String),
    /// No installed application matches the requested package.
    PackageNotInstalled(String),
    /// The pid to attach to is gone.
    ProcessNotFound(u32),
    /// Transport hiccup or timeout worth retrying.
    Transient(String),
    /// Another spawn is in flight; back off and retry.
    Busy,
    Other(String),
}

impl BackendFault {
    fn describe(&self) -> String {
        match self {
            Self::ServerUnreachable(detail) => format!("server unreachable: {detail}"),
            Self::PackageNotInstalled(package) => {
                format!("no application with package name {package} installed")
            }
            Self::ProcessNotFound(pid) => format!("no such process: {pid}"),
            Self::Transient(detail) => format!("transient transport failure: {detail}"),
            Self::Busy => "another spawn operation in progress".to_string(),
            Self::Other(detail) => detail.clone(),
        }
    }
}

/// The dynamic-instrumentation backend's primitives. Implemented over the
/// real frida binding behind the `frida` feature and by scripted doubles
/// in tests. Captured events and hook errors flow through the sender
/// handed to `load_script`.
pub trait SessionBackend: Send {
    fn spawn(&mut self, package: &str) -> std::result::Result<u32, BackendFault>;
    fn attach(&mut self, pid: u32) -> std::result::Result<(), BackendFault>;
    fn load_script(
        &mut self,
        source: &str,
        messages: UnboundedSender<ScriptMessage>,
    ) -> std::result::Result<(), BackendFault>;
    fn unload_script(&mut self) -> std::result::Result<(), BackendFault>;
    fn resume(&mut self, pid: u32) -> std::result::Result<(), BackendFault>;
    fn detach(&mut self) -> std::result::Result<(), BackendFault>;
    fn kill(&mut self, pid: u32) -> std::result::Result<(), BackendFault>;
}

pub struct InstrumentationSession {
    backend: Box<dyn SessionBackend>,
    state: SessionState,
    package: Option<String>,
    pid: Option<u32>,
}

impl InstrumentationSession {
    pub fn new(backend: Box<dyn SessionBackend>) -> Self {
        Self {
            backend,
            state: SessionState::Disconnected,
            package: None,
            pid: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Start the named package suspended. Transient faults re-spawn up to
    /// [`MAX_SPAWN_ATTEMPTS`]; a busy backend waits [`BUSY_BACKOFF`]
    /// between attempts; anything else is fatal.
    pub async fn spawn(&mut self, package: &str, deadline: Deadline) -> Result<u32> {
        self.package = Some(package.to_string());

        for attempt in 1..=MAX_SPAWN_ATTEMPTS {
            deadline.check("spawn")?;

            match self.backend.spawn(package) {
                Ok(pid) => {
                    self.pid = Some(pid);
                    self.state = SessionState::Spawned(pid);
                    debug!(package, pid, "spawned target application suspended");
                    return Ok(pid);
                }
                Err(fault @ (BackendFault::ServerUnreachable(_)
                | BackendFault::PackageNotInstalled(_))) => {
                    return Err(CageError::Session(fault.describe()));
                }
                Err(BackendFault::Transient(detail)) => {
                    warn!(package, attempt, %detail, "spawn failed, re-spawning");
                }
                Err(BackendFault::Busy) => {
                    warn!(package, attempt, "spawn busy, backing off");
                    let pause = BUSY_BACKOFF.min(deadline.remaining());
                    tokio::time::sleep(pause).await;
                }
                Err(fault) => return Err(CageError::Session(fault.describe())),
            }
        }

        Err(CageError::Session(format!(
            "spawning {package} still failing after {MAX_SPAWN_ATTEMPTS} attempts"
        )))
    }

    /// Bind a session to the spawned pid.
    pub async fn attach(&mut self, deadline: Deadline) -> Result<()> {
        deadline.check("attach")?;
        let pid = self.spawned_pid()?;

        self.backend
            .attach(pid)
            .map_err(|fault| CageError::Session(fault.describe()))?;
        self.state = SessionState::Attached;
        debug!(pid, "instrumentation session established");
        Ok(())
    }

    /// Load the compiled script into the attached process. Scripts are
    /// bound to a live session: if one is already loaded the session is
    /// torn down and rebuilt (unload, re-spawn, re-attach) first.
    pub async fn load_script(
        &mut self,
        source: &str,
        messages: UnboundedSender<ScriptMessage>,
        deadline: Deadline,
    ) -> Result<()> {
        if self.state == SessionState::ScriptLoaded {
            debug!("script already loaded, rebuilding session");
            let _ = self.backend.unload_script();
            let _ = self.backend.detach();
            self.state = SessionState::Disconnected;

            let package = self
                .package
                .clone()
                .ok_or_else(|| CageError::Session("no package recorded for re-spawn".to_string()))?;
            self.spawn(&package, deadline).await?;
            self.attach(deadline).await?;
        }

        if self.state != SessionState::Attached {
            return Err(CageError::Session(format!(
                "cannot load a script while {:?}",
                self.state
            )));
        }

        for attempt in 1..=MAX_LOAD_ATTEMPTS {
            deadline.check("load script")?;

            match self.backend.load_script(source, messages.clone()) {
                Ok(()) => {
                    self.state = SessionState::ScriptLoaded;
                    debug!("instrumentation script loaded");
                    return Ok(());
                }
                Err(BackendFault::Transient(detail)) => {
                    warn!(attempt, %detail, "script load failed, reloading");
                }
                Err(fault) => return Err(CageError::Session(fault.describe())),
            }
        }

        Err(CageError::Session(format!(
            "script load still failing after {MAX_LOAD_ATTEMPTS} attempts"
        )))
    }

    /// Resume the suspended target. Valid from any spawned-or-later state.
    pub async fn resume(&mut self) -> Result<()> {
        let pid = self.spawned_pid()?;
        self.backend
            .resume(pid)
            .map_err(|fault| CageError::Session(fault.describe()))?;
        debug!(pid, "target application resumed");
        Ok(())
    }

    /// Unload the script and detach, returning to `Disconnected`. Safe to
    /// call repeatedly.
    pub fn terminate(&mut self) -> Result<()> {
        if self.state == SessionState::ScriptLoaded {
            if let Err(fault) = self.backend.unload_script() {
                warn!(detail = %fault.describe(), "script unload failed");
            }
        }
        if matches!(self.state, SessionState::Attached | SessionState::ScriptLoaded) {
            if let Err(fault) = self.backend.detach() {
                warn!(detail = %fault.describe(), "detach failed");
            }
        }
        self.state = SessionState::Disconnected;
        debug!("instrumentation session terminated");
        Ok(())
    }

    /// Kill the target process outright.
    pub fn kill(&mut self) -> Result<()> {
        let pid = self.spawned_pid()?;
        self.backend
            .kill(pid)
            .map_err(|fault| CageError::Session(fault.describe()))?;
        self.state = SessionState::Terminated;
        self.pid = None;
        Ok(())
    }

    fn spawned_pid(&self) -> Result<u32> {
        self.pid
            .ok_or_else(|| CageError::Session("no spawned process".to_string()))
    }
}
