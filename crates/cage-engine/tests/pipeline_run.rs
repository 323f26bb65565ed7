//! Full pipeline runs against a simulated device and instrumentation
//! backend: the happy path, the rollback invariant under fault injection
//! at every phase, and monitor-failure isolation.

use async_trait::async_trait;
use cage_adb::{CommandOutput, CommandRunner, DeviceTransport, TransportConfig};
use cage_core::{CageError, PhaseEvent, PipelinePhase, Result, ScriptMessage};
use cage_engine::{
    AnalysisPipeline, BackendFault, InteractionDriver, PackageResolver, PipelineConfig,
    ServerFetcher, SessionBackend, WipePolicy,
};
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailPoint {
    None,
    Connectivity,
    Backup,
    Stage,
    Install,
    CaptureHelper,
    Restore,
}

/// Scripted adb endpoint for serial EMULATOR-1.
struct DeviceSim {
    fail: FailPoint,
    backup_calls: AtomicUsize,
    restore_calls: AtomicUsize,
}

impl DeviceSim {
    fn new(fail: FailPoint) -> Arc<Self> {
        Arc::new(Self {
            fail,
            backup_calls: AtomicUsize::new(0),
            restore_calls: AtomicUsize::new(0),
        })
    }

    fn ok(stdout: &str) -> io::Result<CommandOutput> {
        Ok(CommandOutput {
            status: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    fn fail_with(stderr: &str) -> io::Result<CommandOutput> {
        Ok(CommandOutput {
            status: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }

    fn shell_response(&self, cmd: &[&str]) -> io::Result<CommandOutput> {
        match cmd {
            ["getprop", "ro.product.cpu.abi"] => Self::ok("arm64-v8a"),
            ["getprop", "ro.build.version.sdk"] => Self::ok("34"),
            ["ls", "/data/data"] => Self::ok("com.android.phone\ncom.victim.notes"),
            ["ls", "-R", "/sdcard"] => {
                Self::ok("/sdcard/DCIM:\nholiday.jpg\n\n/sdcard/Download:\nreadme.txt\n")
            }
            ["ls", "/data/local/tmp/frida-server"] => Self::ok("/data/local/tmp/frida-server"),
            ["cat", _] => Self::ok(concat!(
                r#"<node text="Back up my data" bounds="[540,1700][1080,1800]" />"#,
                r#"<node text="Restore my data" bounds="[540,1500][1080,1600]" />"#,
            )),
            [helper, ..] if *helper == "/data/local/tmp/tcpdump" => {
                if cmd.contains(&"$!") {
                    if self.fail == FailPoint::CaptureHelper {
                        Self::fail_with("tcpdump: not executable")
                    } else {
                        Self::ok("4321")
                    }
                } else {
                    Self::ok("")
                }
            }
            _ => Self::ok(""),
        }
    }
}

#[async_trait]
impl CommandRunner for DeviceSim {
    async fn run(&self, _program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        // Transport commands carry the `-s <serial>` prefix.
        let cmd = if argv.first() == Some(&"-s") {
            &argv[2..]
        } else {
            &argv[..]
        };

        match cmd {
            ["get-state"] => {
                if self.fail == FailPoint::Connectivity {
                    Self::fail_with("error: device 'EMULATOR-1' not found")
                } else {
                    Self::ok("device")
                }
            }
            ["backup", rest @ ..] => {
                self.backup_calls.fetch_add(1, Ordering::SeqCst);
                if self.fail == FailPoint::Backup {
                    return Self::fail_with("adb: backup failed");
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                if let Some(at) = rest.iter().position(|arg| *arg == "-f") {
                    if let Some(path) = rest.get(at + 1) {
                        std::fs::write(path, b"ANDROID BACKUP\n5\n1\nnone\n").expect("write backup");
                    }
                }
                Self::ok("")
            }
            ["restore", _] => {
                self.restore_calls.fetch_add(1, Ordering::SeqCst);
                if self.fail == FailPoint::Restore {
                    return Self::fail_with("adb: restore failed");
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                Self::ok("")
            }
            ["root"] => Self::ok(""),
            ["remount"] => {
                if self.fail == FailPoint::Stage {
                    Self::fail_with("remount failed: verity enabled")
                } else {
                    Self::ok("remount succeeded")
                }
            }
            ["install", _] => {
                if self.fail == FailPoint::Install {
                    Self::fail_with("adb: failed to install: INSTALL_FAILED_INVALID_APK")
                } else {
                    Self::ok("Success")
                }
            }
            ["push", ..] => Self::ok(""),
            ["pull", source, target] => {
                let content: &[u8] = if source.ends_with(".pcap") {
                    b"\xd4\xc3\xb2\xa1\x02\x00\x04\x00captured packets"
                } else {
                    b"12:00:01 IP 10.0.2.16.4242 > 93.184.216.34.443\n"
                };
                std::fs::write(target, content).expect("write pulled artifact");
                Self::ok("")
            }
            ["shell", shell_cmd @ ..] => self.shell_response(shell_cmd),
            _ => Self::ok(""),
        }
    }
}

/// Backend double: spawns pid 1234 suspended, emits two captured events
/// when the script loads, releases the channel on unload.
struct BackendSim {
    fail_spawn: bool,
    messages: Option<UnboundedSender<ScriptMessage>>,
}

impl BackendSim {
    fn new(fail_spawn: bool) -> Box<Self> {
        Box::new(Self {
            fail_spawn,
            messages: None,
        })
    }
}

impl SessionBackend for BackendSim {
    fn spawn(&mut self, package: &str) -> std::result::Result<u32, BackendFault> {
        if self.fail_spawn {
            return Err(BackendFault::PackageNotInstalled(package.to_string()));
        }
        Ok(1234)
    }

    fn attach(&mut self, _pid: u32) -> std::result::Result<(), BackendFault> {
        Ok(())
    }

    fn load_script(
        &mut self,
        _source: &str,
        messages: UnboundedSender<ScriptMessage>,
    ) -> std::result::Result<(), BackendFault> {
        let _ = messages.send(ScriptMessage::Event(json!({
            "Category": "fingerprinting",
            "Class": "android.telephony.TelephonyManager",
            "Method": "getDeviceId",
        })));
        let _ = messages.send(ScriptMessage::Event(json!({
            "Category": "execution",
            "Class": "java.lang.ProcessBuilder",
            "Method": "start",
            "Command": "[/system/bin/sh, -c, getprop]",
        })));
        self.messages = Some(messages);
        Ok(())
    }

    fn unload_script(&mut self) -> std::result::Result<(), BackendFault> {
        self.messages = None;
        Ok(())
    }

    fn resume(&mut self, _pid: u32) -> std::result::Result<(), BackendFault> {
        Ok(())
    }

    fn detach(&mut self) -> std::result::Result<(), BackendFault> {
        Ok(())
    }

    fn kill(&mut self, _pid: u32) -> std::result::Result<(), BackendFault> {
        Ok(())
    }
}

struct StubFetcher {
    helper: PathBuf,
}

impl StubFetcher {
    fn new(dir: &Path) -> Arc<Self> {
        let helper = dir.join("tcpdump");
        std::fs::write(&helper, b"elf").expect("write helper");
        Arc::new(Self { helper })
    }
}

#[async_trait]
impl ServerFetcher for StubFetcher {
    async fn fetch_server(&self, _arch: &str) -> Result<PathBuf> {
        Ok(self.helper.clone())
    }

    async fn fetch_capture_helper(&self, _arch: &str) -> Result<PathBuf> {
        Ok(self.helper.clone())
    }
}

struct StubResolver;

#[async_trait]
impl PackageResolver for StubResolver {
    async fn package_name(&self, _apk: &Path) -> Result<String> {
        Ok("com.example.app".to_string())
    }
}

struct StubDriver {
    fail: bool,
}

#[async_trait]
impl InteractionDriver for StubDriver {
    async fn interact(
        &self,
        _transport: &DeviceTransport,
        _package: &str,
        _window: Duration,
    ) -> Result<()> {
        if self.fail {
            Err(CageError::command("monkey", "exploration crashed"))
        } else {
            Ok(())
        }
    }
}

struct Harness {
    _workspace: TempDir,
    sim: Arc<DeviceSim>,
    pipeline: AnalysisPipeline,
}

fn harness(fail: FailPoint, fail_spawn: bool, fail_interact: bool) -> Harness {
    let workspace = TempDir::new().expect("workspace");
    let sim = DeviceSim::new(fail);

    let hooks_file = workspace.path().join("hooks_def.json");
    std::fs::write(
        &hooks_file,
        r#"[{"class": "android.telephony.TelephonyManager",
             "method": "getDeviceId",
             "params": [],
             "hooked_params": {},
             "category": "fingerprinting"}]"#,
    )
    .expect("write hooks");

    let transport = Arc::new(DeviceTransport::with_runner(
        "EMULATOR-1",
        Arc::clone(&sim) as Arc<dyn CommandRunner>,
        TransportConfig {
            ui_poll_interval: Duration::from_millis(5),
            ui_action_timeout: Duration::from_secs(2),
        },
    ));

    let config = PipelineConfig {
        analyses_dir: workspace.path().join("analyses"),
        hooks_file,
        wipe_policy: WipePolicy::Skip,
        interaction_window: Duration::from_millis(10),
        call_budget: Duration::from_secs(5),
    };

    let pipeline = AnalysisPipeline::new(
        transport,
        BackendSim::new(fail_spawn),
        StubFetcher::new(workspace.path()),
        Arc::new(StubResolver),
        Arc::new(StubDriver {
            fail: fail_interact,
        }),
        workspace.path().join("sample.apk"),
        config,
    );

    Harness {
        _workspace: workspace,
        sim,
        pipeline,
    }
}

#[tokio::test]
async fn full_run_walks_every_phase_and_collects_artifacts() {
    let mut h = harness(FailPoint::None, false, false);

    h.pipeline.run().await.expect("pipeline run");

    assert_eq!(
        h.pipeline.phase_log(),
        &[
            PhaseEvent::ConnectivityOk,
            PhaseEvent::BackupOk,
            PhaseEvent::StageOk,
            PhaseEvent::InstallOk,
            PhaseEvent::Spawned(1234),
            PhaseEvent::Suspended,
            PhaseEvent::MonitorStarted("API monitoring".to_string()),
            PhaseEvent::MonitorStarted("network capture".to_string()),
            PhaseEvent::Resumed,
            PhaseEvent::Interacted,
            PhaseEvent::MonitorStopped("API monitoring".to_string()),
            PhaseEvent::MonitorStopped("network capture".to_string()),
            PhaseEvent::RestoreOk,
        ]
    );

    let task = h.pipeline.task().expect("task recorded");
    assert_eq!(task.id, 0);
    assert_eq!(task.phase, PipelinePhase::Done);
    assert!(task.finished_at.is_some());

    let events = std::fs::read_to_string(task.api_events_path()).expect("events log");
    assert!(!events.trim().is_empty(), "no captured events written");
    assert!(events.contains("getDeviceId"));

    let pcap = std::fs::read(task.pcap_path()).expect("pcap pulled");
    assert!(!pcap.is_empty(), "pcap artifact is empty");
    assert!(task.net_log_path().is_file());
    assert!(task.backup_path().is_file());

    assert_eq!(h.sim.restore_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn connectivity_failure_aborts_before_anything_runs() {
    let mut h = harness(FailPoint::Connectivity, false, false);

    let err = h.pipeline.run().await.unwrap_err();
    assert!(err.is_connectivity(), "got {err}");
    assert!(h.pipeline.phase_log().is_empty());
    assert!(h.pipeline.task().is_none());
    assert_eq!(h.sim.backup_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.sim.restore_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failure_before_backup_completion_never_restores() {
    let mut h = harness(FailPoint::Backup, false, false);

    h.pipeline.run().await.unwrap_err();
    assert_eq!(h.sim.restore_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        h.pipeline.task().expect("task").phase,
        PipelinePhase::Failed
    );
}

#[tokio::test]
async fn staging_failure_still_restores_exactly_once() {
    let mut h = harness(FailPoint::Stage, false, false);

    let err = h.pipeline.run().await.unwrap_err();
    assert!(matches!(err, CageError::Startup(_)), "got {err}");
    assert_eq!(h.sim.restore_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.pipeline.phase_log().last(),
        Some(&PhaseEvent::RestoreOk)
    );
}

#[tokio::test]
async fn install_failure_still_restores_exactly_once() {
    let mut h = harness(FailPoint::Install, false, false);

    h.pipeline.run().await.unwrap_err();
    assert_eq!(h.sim.restore_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn spawn_failure_still_restores_exactly_once() {
    let mut h = harness(FailPoint::None, true, false);

    let err = h.pipeline.run().await.unwrap_err();
    assert!(matches!(err, CageError::Session(_)), "got {err}");
    assert_eq!(h.sim.restore_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn interaction_failure_still_stops_monitors_and_restores() {
    let mut h = harness(FailPoint::None, false, true);

    h.pipeline.run().await.unwrap_err();
    let log = h.pipeline.phase_log();
    assert!(log.contains(&PhaseEvent::MonitorStopped("API monitoring".to_string())));
    assert!(log.contains(&PhaseEvent::MonitorStopped("network capture".to_string())));
    assert_eq!(log.last(), Some(&PhaseEvent::RestoreOk));
    assert_eq!(h.sim.restore_calls.load(Ordering::SeqCst), 1);

    // Evidence gathered before the failure was still pulled.
    let task = h.pipeline.task().expect("task");
    assert!(task.pcap_path().is_file());
}

#[tokio::test]
async fn capture_module_failure_is_isolated_from_the_run() {
    let mut h = harness(FailPoint::CaptureHelper, false, false);

    h.pipeline.run().await.expect("degraded run still succeeds");
    let log = h.pipeline.phase_log();
    assert!(log.contains(&PhaseEvent::MonitorStarted("API monitoring".to_string())));
    assert!(!log.contains(&PhaseEvent::MonitorStarted("network capture".to_string())));
    assert!(log.contains(&PhaseEvent::Resumed));
    assert_eq!(log.last(), Some(&PhaseEvent::RestoreOk));
}

#[tokio::test]
async fn restore_failure_is_reported_not_retried() {
    let mut h = harness(FailPoint::Restore, false, false);

    h.pipeline.run().await.expect("forward steps succeeded");
    assert_eq!(h.sim.restore_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.pipeline.phase_log().last(),
        Some(&PhaseEvent::RestoreFailed)
    );
}

#[tokio::test]
async fn task_ids_advance_across_runs_in_the_same_workspace() {
    let workspace = TempDir::new().expect("workspace");
    for expected_id in 0u64..2 {
        std::fs::create_dir_all(workspace.path().join("analyses")).expect("mkdir");
        let id = cage_core::task::next_task_id(&workspace.path().join("analyses"))
            .expect("next id");
        assert_eq!(id, expected_id);
        std::fs::create_dir_all(
            workspace
                .path()
                .join("analyses")
                .join(format!("task_{expected_id}")),
        )
        .expect("mkdir task");
    }
}
