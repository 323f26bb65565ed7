//! Prepare the device for a run: root access, a clean data surface, the
//! instrumentation server matching the device architecture, and the
//! packet-capture helper. All staging state lives in the returned
//! [`StagingContext`], owned by the pipeline for the task's lifetime.

use crate::monitor::CAPTURE_HELPER_PATH;
use async_trait::async_trait;
use cage_adb::DeviceTransport;
use cage_core::{CageError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info, warn};

pub const SERVER_DEVICE_PATH: &str = "/data/local/tmp/frida-server";

/// System package prefixes whose data is left alone by the wipe.
const SYSTEM_PACKAGE_PREFIXES: [&str; 3] = ["com.android.", "com.google.", "android"];

/// App-data subdirectories cleared for every non-system package.
const DATA_SUBDIRS: [&str; 3] = ["files", "databases", "shared_prefs"];

/// User-media suffixes removed from shared storage before the sample runs.
const MEDIA_EXTENSIONS: [&str; 6] = [".jpg", ".jpeg", ".png", ".mp4", ".db", ".xml"];

/// What to do when a wipe step fails: log and move on, or abort staging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipePolicy {
    Skip,
    Abort,
}

impl FromStr for WipePolicy {
    type Err = String;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "skip" => Ok(WipePolicy::Skip),
            "abort" => Ok(WipePolicy::Abort),
            other => Err(format!("unknown wipe policy: {other}")),
        }
    }
}

/// Resolved device facts plus what staging put in place.
#[derive(Debug, Clone)]
pub struct StagingContext {
    pub arch: String,
    pub api_level: u32,
    pub server_pushed: bool,
}

/// Provides the on-host artifacts staging pushes to the device. Download
/// and decompression internals live behind this seam.
#[async_trait]
pub trait ServerFetcher: Send + Sync {
    /// Local path of an instrumentation server binary for `arch`.
    async fn fetch_server(&self, arch: &str) -> Result<PathBuf>;
    /// Local path of a packet-capture helper binary for `arch`.
    async fn fetch_capture_helper(&self, arch: &str) -> Result<PathBuf>;
}

fn as_startup(err: CageError) -> CageError {
    // Device loss keeps its own class; everything else that breaks
    // staging is a startup failure.
    if err.is_connectivity() {
        err
    } else {
        CageError::Startup(err.to_string())
    }
}

pub async fn stage_device(
    transport: &DeviceTransport,
    fetcher: &dyn ServerFetcher,
    policy: WipePolicy,
) -> Result<StagingContext> {
    transport.run(&["root"]).await.map_err(as_startup)?;
    transport.run(&["remount"]).await.map_err(as_startup)?;

    wipe_app_data(transport, policy).await?;
    wipe_user_media(transport, policy).await?;

    let arch = transport.architecture().await.map_err(as_startup)?;
    if arch == "undetermined" {
        return Err(CageError::Startup(
            "unable to determine device architecture".to_string(),
        ));
    }
    let api_level = transport.api_level().await.map_err(as_startup)?;
    info!(%arch, api_level, "device resolved");

    let server_pushed = ensure_server(transport, fetcher, &arch).await?;

    let helper = fetcher.fetch_capture_helper(&arch).await?;
    transport
        .push(&helper, CAPTURE_HELPER_PATH)
        .await
        .map_err(as_startup)?;
    transport
        .shell(&["chmod", "0755", CAPTURE_HELPER_PATH])
        .await
        .map_err(as_startup)?;

    debug!("device is ready");
    Ok(StagingContext {
        arch,
        api_level,
        server_pushed,
    })
}

/// Clear the writable data of every non-system package.
async fn wipe_app_data(transport: &DeviceTransport, policy: WipePolicy) -> Result<()> {
    let listing = match transport.shell(&["ls", "/data/data"]).await {
        Ok(listing) => listing.unwrap_or_default(),
        Err(err) => return wipe_failure(policy, err),
    };

    for package in listing.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if SYSTEM_PACKAGE_PREFIXES
            .iter()
            .any(|prefix| package.starts_with(prefix))
        {
            continue;
        }
        for subdir in DATA_SUBDIRS {
            let target = format!("/data/data/{package}/{subdir}/*");
            if let Err(err) = transport.shell(&["su", "-c", "rm", "-rf", &target]).await {
                wipe_failure(policy, err)?;
            }
        }
    }
    Ok(())
}

/// Remove common user-media files from shared storage. The `ls -R`
/// output is a sequence of `dir:` headers each followed by entries.
async fn wipe_user_media(transport: &DeviceTransport, policy: WipePolicy) -> Result<()> {
    info!("removing user media before running the sample");
    let listing = match transport.shell(&["ls", "-R", "/sdcard"]).await {
        Ok(listing) => listing.unwrap_or_default(),
        Err(err) => return wipe_failure(policy, err),
    };

    let mut current_dir: Option<String> = None;
    for line in listing.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            current_dir = None;
            continue;
        }
        if let Some(dir) = line.strip_suffix(':') {
            current_dir = Some(dir.to_string());
            continue;
        }
        let Some(dir) = current_dir.as_deref() else {
            continue;
        };

        let lowered = line.to_lowercase();
        if MEDIA_EXTENSIONS.iter().any(|ext| lowered.ends_with(ext)) {
            let target = format!("{dir}/{line}");
            if let Err(err) = transport.shell(&["su", "-c", "rm", &target]).await {
                wipe_failure(policy, err)?;
            }
        }
    }
    Ok(())
}

fn wipe_failure(policy: WipePolicy, err: CageError) -> Result<()> {
    if err.is_connectivity() {
        return Err(err);
    }
    match policy {
        WipePolicy::Skip => {
            warn!(%err, "wipe step failed, skipping");
            Ok(())
        }
        WipePolicy::Abort => Err(CageError::Startup(format!("data wipe failed: {err}"))),
    }
}

/// Make sure the instrumentation server is present and running. A missing
/// binary is fetched and pushed; a stale server instance is replaced.
async fn ensure_server(
    transport: &DeviceTransport,
    fetcher: &dyn ServerFetcher,
    arch: &str,
) -> Result<bool> {
    let present = transport.shell(&["ls", SERVER_DEVICE_PATH]).await.is_ok();

    if !present {
        info!(%arch, "instrumentation server missing, fetching");
        let server = fetcher.fetch_server(arch).await?;
        transport
            .push(&server, SERVER_DEVICE_PATH)
            .await
            .map_err(as_startup)?;
        transport
            .shell(&["chmod", "0755", SERVER_DEVICE_PATH])
            .await
            .map_err(as_startup)?;
    }

    // A server from a previous run may still hold the port.
    if let Err(err) = transport
        .shell(&["su", "-c", "killall", "frida-server"])
        .await
    {
        debug!(%err, "no stale server to kill");
    }
    transport
        .shell(&["su", "-c", SERVER_DEVICE_PATH, ">/dev/null", "2>&1", "&"])
        .await
        .map_err(as_startup)?;

    Ok(!present)
}
