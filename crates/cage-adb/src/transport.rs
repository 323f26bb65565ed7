use crate::layout::find_label_center;
use crate::runner::{AdbRunner, CommandOutput, CommandRunner};
use cage_core::{CageError, Result};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const ADB: &str = "adb";
const UI_DUMP_PATH: &str = "/sdcard/window_dump.xml";

/// Architecture tags adb may report, mapped to the canonical short form
/// used to pick on-device binaries.
const ABI_MAP: [(&str, &str); 5] = [
    ("armeabi", "arm"),
    ("armeabi-v7a", "arm"),
    ("arm64-v8a", "arm64"),
    ("x86", "x86"),
    ("x86_64", "x86_64"),
];

/// Substrings in adb output that mean the device itself is gone, not that
/// the command it carried failed.
const UNREACHABLE_MARKERS: [&str; 4] = [
    "device offline",
    "not found",
    "no devices/emulators found",
    "device unauthorized",
];

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Pause between screen captures while a UI-driven action waits for
    /// its confirmation dialog.
    pub ui_poll_interval: Duration,
    /// Overall ceiling on one UI-driven action.
    pub ui_action_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ui_poll_interval: Duration::from_secs(1),
            ui_action_timeout: Duration::from_secs(120),
        }
    }
}

/// Command channel to one device, addressed by serial. Architecture and
/// API level are resolved once and cached for the life of the task; the
/// transport itself is a serialized single endpoint and callers must not
/// issue concurrent commands against the same serial.
pub struct DeviceTransport {
    runner: Arc<dyn CommandRunner>,
    serial: String,
    config: TransportConfig,
    cached_abi: Mutex<Option<String>>,
    cached_api_level: Mutex<Option<u32>>,
}

impl DeviceTransport {
    pub fn new(serial: impl Into<String>) -> Self {
        Self::with_runner(serial, Arc::new(AdbRunner), TransportConfig::default())
    }

    pub fn with_runner(
        serial: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
        config: TransportConfig,
    ) -> Self {
        Self {
            runner,
            serial: serial.into(),
            config,
            cached_abi: Mutex::new(None),
            cached_api_level: Mutex::new(None),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    fn prefixed(&self, args: &[&str]) -> Vec<String> {
        let mut full = Vec::with_capacity(args.len() + 2);
        full.push("-s".to_string());
        full.push(self.serial.clone());
        full.extend(args.iter().map(|arg| arg.to_string()));
        full
    }

    fn classify(command: &str, output: CommandOutput) -> Result<Option<String>> {
        let stderr = output.stderr.trim();
        if !output.success() || !stderr.is_empty() {
            let haystack = format!("{} {}", stderr, output.stdout).to_lowercase();
            if UNREACHABLE_MARKERS
                .iter()
                .any(|marker| haystack.contains(marker))
            {
                return Err(CageError::Connectivity(format!(
                    "`{command}` reported: {stderr}"
                )));
            }
            return Err(CageError::command(
                command,
                format!("exit {}: {stderr}", output.status),
            ));
        }

        let stdout = output.stdout.trim();
        if stdout.is_empty() {
            Ok(None)
        } else {
            Ok(Some(stdout.to_string()))
        }
    }

    fn launch_error(err: io::Error) -> CageError {
        if err.kind() == io::ErrorKind::NotFound {
            CageError::dependency(ADB, "binary not found in PATH")
        } else {
            CageError::command(ADB, err.to_string())
        }
    }

    /// Run one adb command against the bound device.
    pub async fn run(&self, args: &[&str]) -> Result<Option<String>> {
        let command = args.join(" ");
        debug!(serial = %self.serial, %command, "adb");
        let output = self
            .runner
            .run(ADB, &self.prefixed(args))
            .await
            .map_err(Self::launch_error)?;
        Self::classify(&command, output)
    }

    /// Run an `adb shell` command.
    pub async fn shell(&self, args: &[&str]) -> Result<Option<String>> {
        let mut shell_args = Vec::with_capacity(args.len() + 1);
        shell_args.push("shell");
        shell_args.extend_from_slice(args);
        self.run(&shell_args).await
    }

    /// Cheap reachability probe; any failure here means the device is gone.
    pub async fn check_connectivity(&self) -> Result<()> {
        let state = self
            .run(&["get-state"])
            .await
            .map_err(|err| CageError::Connectivity(err.to_string()))?;
        match state.as_deref() {
            Some("device") => Ok(()),
            other => Err(CageError::Connectivity(format!(
                "device {} is in state {:?}",
                self.serial,
                other.unwrap_or("unknown")
            ))),
        }
    }

    pub async fn prop(&self, name: &str) -> Result<String> {
        Ok(self
            .shell(&["getprop", name])
            .await?
            .unwrap_or_default())
    }

    /// The device's canonical architecture tag. Unrecognized ABIs resolve
    /// to `"undetermined"` rather than failing; only the device query
    /// itself can error.
    pub async fn architecture(&self) -> Result<String> {
        if let Some(abi) = self.cached_abi.lock().expect("abi cache").clone() {
            return Ok(abi);
        }

        let reported = self.prop("ro.product.cpu.abi").await?.to_lowercase();
        let reported = reported.trim();
        let arch = ABI_MAP
            .iter()
            .find(|(abi, _)| *abi == reported)
            .map(|(_, arch)| (*arch).to_string())
            .unwrap_or_else(|| "undetermined".to_string());

        *self.cached_abi.lock().expect("abi cache") = Some(arch.clone());
        Ok(arch)
    }

    pub async fn api_level(&self) -> Result<u32> {
        if let Some(level) = *self.cached_api_level.lock().expect("api cache") {
            return Ok(level);
        }

        let raw = self.prop("ro.build.version.sdk").await?;
        let level = raw.trim().parse::<u32>().map_err(|_| {
            CageError::command("getprop ro.build.version.sdk", format!("unparsable `{raw}`"))
        })?;

        *self.cached_api_level.lock().expect("api cache") = Some(level);
        Ok(level)
    }

    pub async fn install(&self, apk: &Path) -> Result<()> {
        info!(apk = %apk.display(), "installing target application");
        self.run(&["install", &apk.display().to_string()]).await?;
        Ok(())
    }

    pub async fn push(&self, source: &Path, device_path: &str) -> Result<()> {
        self.run(&["push", &source.display().to_string(), device_path])
            .await?;
        Ok(())
    }

    pub async fn pull(&self, device_path: &str, target: &Path) -> Result<()> {
        self.run(&["pull", device_path, &target.display().to_string()])
            .await?;
        Ok(())
    }

    pub async fn tap(&self, x: i64, y: i64) -> Result<()> {
        self.shell(&["input", "tap", &x.to_string(), &y.to_string()])
            .await?;
        Ok(())
    }

    pub async fn kill_process(&self, pid: u32) -> Result<()> {
        self.shell(&["kill", "-s", "9", &pid.to_string()]).await?;
        debug!(pid, "killed on-device process");
        Ok(())
    }

    /// Snapshot of the current screen as a serialized UI tree.
    async fn ui_layout(&self) -> Result<Option<String>> {
        self.shell(&["uiautomator", "dump", UI_DUMP_PATH]).await?;
        self.shell(&["cat", UI_DUMP_PATH]).await
    }

    /// Run a command that blocks on an on-device confirmation dialog.
    ///
    /// The command runs in the background while this loop captures the
    /// screen at a bounded interval and taps `screen_label`'s bounding-box
    /// center whenever it is visible. Capture failures while the dialog is
    /// not up yet are ignored. If the overall timeout elapses the
    /// background command is abandoned, not killed; the caller must verify
    /// device state afterwards.
    pub async fn ui_driven_action(
        &self,
        args: &[&str],
        screen_label: &str,
    ) -> Result<Option<String>> {
        let command = args.join(" ");
        let runner = Arc::clone(&self.runner);
        let full_args = self.prefixed(args);
        let mut operation = tokio::spawn(async move { runner.run(ADB, &full_args).await });

        let started = Instant::now();
        let output = loop {
            tokio::select! {
                joined = &mut operation => {
                    break joined
                        .map_err(|err| CageError::command(&command, format!("background task failed: {err}")))?
                        .map_err(Self::launch_error)?;
                }
                _ = tokio::time::sleep(self.config.ui_poll_interval) => {}
            }

            if started.elapsed() >= self.config.ui_action_timeout {
                operation.abort();
                return Err(CageError::command(
                    &command,
                    format!(
                        "no on-device confirmation within {:?}; operation abandoned",
                        self.config.ui_action_timeout
                    ),
                ));
            }

            if let Ok(Some(layout)) = self.ui_layout().await {
                if let Some((x, y)) = find_label_center(&layout, screen_label) {
                    debug!(%screen_label, x, y, "confirming on-device dialog");
                    if let Err(err) = self.tap(x, y).await {
                        warn!(%err, "confirmation tap failed");
                    }
                }
            }
        };

        Self::classify(&command, output)
    }

    /// Full device backup; blocks on the on-device confirmation dialog.
    pub async fn backup(&self, host_path: &Path) -> Result<()> {
        info!(to = %host_path.display(), "backing up the device");
        self.ui_driven_action(
            &["backup", "-all", "-f", &host_path.display().to_string()],
            "back up my data",
        )
        .await?;
        info!("device backed up");
        Ok(())
    }

    /// Restore the device from a previously taken backup.
    pub async fn restore(&self, host_path: &Path) -> Result<()> {
        info!(from = %host_path.display(), "restoring device state from backup");
        self.ui_driven_action(
            &["restore", &host_path.display().to_string()],
            "restore my data",
        )
        .await?;
        info!("backup restored");
        Ok(())
    }
}

/// Serials of connected devices in the `device` state, in `adb devices`
/// order.
pub async fn list_devices(runner: &dyn CommandRunner) -> Result<Vec<String>> {
    let output = runner
        .run(ADB, &["devices".to_string()])
        .await
        .map_err(DeviceTransport::launch_error)?;
    if !output.success() {
        return Err(CageError::Connectivity(format!(
            "`adb devices` failed: {}",
            output.stderr.trim()
        )));
    }

    Ok(output
        .stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect())
}
