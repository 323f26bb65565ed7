use crate::error::CageError;
use crate::phase::PipelinePhase;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

/// One analysis run's workspace and lifecycle record. A task exclusively
/// owns its directory tree for its whole lifetime and is finalized exactly
/// once, success or failure.
#[derive(Debug)]
pub struct AnalysisTask {
    pub id: u64,
    pub apk_path: PathBuf,
    root: PathBuf,
    pub phase: PipelinePhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AnalysisTask {
    /// Allocate the next task under `analyses_dir`, creating its
    /// `backup/` and `logs/` subtrees.
    pub fn allocate(analyses_dir: &Path, apk_path: &Path) -> Result<Self, CageError> {
        let id = next_task_id(analyses_dir)?;
        let root = analyses_dir.join(format!("task_{id}"));

        fs::create_dir_all(root.join("backup"))
            .and_then(|_| fs::create_dir_all(root.join("logs")))
            .map_err(|err| {
                CageError::Startup(format!(
                    "could not create workspace {}: {err}",
                    root.display()
                ))
            })?;

        Ok(Self {
            id,
            apk_path: apk_path.to_path_buf(),
            root,
            phase: PipelinePhase::Init,
            started_at: Utc::now(),
            finished_at: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backup_path(&self) -> PathBuf {
        self.root.join("backup").join("backup.ab")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn api_events_path(&self) -> PathBuf {
        self.logs_dir().join("frida_logs.log")
    }

    pub fn api_errors_path(&self) -> PathBuf {
        self.logs_dir().join("frida_errors_logs.log")
    }

    pub fn pcap_path(&self) -> PathBuf {
        self.logs_dir().join("net_dump.pcap")
    }

    pub fn net_log_path(&self) -> PathBuf {
        self.logs_dir().join("net_log.log")
    }

    /// Terminal transition; stamps the end time once.
    pub fn finalize(&mut self, phase: PipelinePhase) {
        self.phase = phase;
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }
}

/// Next free task id: one past the highest `task_<n>` already present, or
/// 0 for a fresh workspace. Entries that do not match the naming scheme
/// are ignored.
pub fn next_task_id(analyses_dir: &Path) -> Result<u64, CageError> {
    if !analyses_dir.exists() {
        return Ok(0);
    }

    let entries = fs::read_dir(analyses_dir).map_err(|err| {
        CageError::Startup(format!(
            "could not read workspace {}: {err}",
            analyses_dir.display()
        ))
    })?;

    let mut max_seen: Option<u64> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(id) = name
            .to_str()
            .and_then(|name| name.strip_prefix("task_"))
            .and_then(|suffix| suffix.parse::<u64>().ok())
        else {
            continue;
        };
        max_seen = Some(max_seen.map_or(id, |seen| seen.max(id)));
    }

    Ok(max_seen.map_or(0, |seen| seen + 1))
}
