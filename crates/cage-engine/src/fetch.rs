//! Host-side artifact acquisition for staging: the instrumentation server
//! (downloaded and decompressed into a local cache) and the prebuilt
//! packet-capture helper (shipped per architecture family).

use crate::staging::ServerFetcher;
use async_trait::async_trait;
use cage_core::{CageError, Result};
use std::env;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Server release the sandbox pins; the artifact name encodes it.
pub const FRIDA_SERVER_VERSION: &str = "16.2.1";

#[derive(Clone, Copy, Debug)]
enum Downloader {
    Curl,
    Wget,
}

impl Downloader {
    async fn download_to_file(self, url: &str, path: &Path) -> Result<()> {
        let status = match self {
            Downloader::Curl => {
                Command::new("curl")
                    .args(["-fsSL", "-o"])
                    .arg(path)
                    .arg(url)
                    .status()
                    .await
            }
            Downloader::Wget => {
                Command::new("wget")
                    .arg("-qO")
                    .arg(path)
                    .arg(url)
                    .status()
                    .await
            }
        }
        .map_err(|err| CageError::Startup(format!("failed to launch downloader: {err}")))?;

        if !status.success() {
            return Err(CageError::Startup(format!(
                "download of {url} exited with {status}"
            )));
        }
        Ok(())
    }
}

fn command_exists(name: &str) -> bool {
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|path| path.join(name).is_file()))
        .unwrap_or(false)
}

fn detect_downloader() -> Result<Downloader> {
    if command_exists("curl") {
        return Ok(Downloader::Curl);
    }
    if command_exists("wget") {
        return Ok(Downloader::Wget);
    }
    Err(CageError::dependency(
        "curl",
        "neither curl nor wget was found in PATH",
    ))
}

async fn decompress_xz(archive: &Path) -> Result<()> {
    let status = Command::new("xz")
        .args(["-d", "-f"])
        .arg(archive)
        .status()
        .await
        .map_err(|err| CageError::dependency("xz", err.to_string()))?;

    if !status.success() {
        return Err(CageError::Startup(format!(
            "decompressing {} exited with {status}",
            archive.display()
        )));
    }
    Ok(())
}

/// Fetcher used by the real pipeline: caches server binaries under a misc
/// directory and resolves the capture helper from a prebuilt tree.
pub struct DownloadFetcher {
    cache_dir: PathBuf,
    helpers_dir: PathBuf,
}

impl DownloadFetcher {
    pub fn new(cache_dir: PathBuf, helpers_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            helpers_dir,
        }
    }
}

#[async_trait]
impl ServerFetcher for DownloadFetcher {
    async fn fetch_server(&self, arch: &str) -> Result<PathBuf> {
        let name = format!("frida-server-{FRIDA_SERVER_VERSION}-android-{arch}");
        let binary = self.cache_dir.join(&name);
        if binary.is_file() {
            debug!(path = %binary.display(), "using cached server binary");
            return Ok(binary);
        }

        tokio::fs::create_dir_all(&self.cache_dir).await.map_err(|err| {
            CageError::Startup(format!(
                "cannot create cache dir {}: {err}",
                self.cache_dir.display()
            ))
        })?;

        let archive = self.cache_dir.join(format!("{name}.xz"));
        let url = format!(
            "https://github.com/frida/frida/releases/download/{FRIDA_SERVER_VERSION}/{name}.xz"
        );
        info!(%url, "downloading the instrumentation server");

        let downloader = detect_downloader()?;
        downloader.download_to_file(&url, &archive).await?;
        decompress_xz(&archive).await?;

        if !binary.is_file() {
            return Err(CageError::Startup(
                "server download failed, aborting".to_string(),
            ));
        }
        Ok(binary)
    }

    async fn fetch_capture_helper(&self, arch: &str) -> Result<PathBuf> {
        // Prebuilt helpers are grouped by family: arm covers arm/arm64,
        // x86 covers x86/x86_64.
        let family = if arch.starts_with("arm") { "arm" } else { "x86" };
        let helper = self.helpers_dir.join(family).join("tcpdump");
        if !helper.is_file() {
            return Err(CageError::dependency(
                "tcpdump",
                format!("no prebuilt capture helper at {}", helper.display()),
            ));
        }
        Ok(helper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn cached_server_binary_short_circuits_the_download() {
        let cache = TempDir::new().expect("temp dir");
        let name = format!("frida-server-{FRIDA_SERVER_VERSION}-android-arm64");
        let cached = cache.path().join(&name);
        std::fs::write(&cached, b"elf").expect("write");

        let fetcher = DownloadFetcher::new(cache.path().to_path_buf(), PathBuf::from("/none"));
        let resolved = fetcher.fetch_server("arm64").await.expect("fetch");
        assert_eq!(resolved, cached);
    }

    #[tokio::test]
    async fn capture_helper_resolves_by_architecture_family() {
        let helpers = TempDir::new().expect("temp dir");
        std::fs::create_dir_all(helpers.path().join("arm")).expect("mkdir");
        std::fs::write(helpers.path().join("arm").join("tcpdump"), b"elf").expect("write");

        let fetcher = DownloadFetcher::new(PathBuf::from("/none"), helpers.path().to_path_buf());
        for arch in ["arm", "arm64"] {
            let helper = fetcher.fetch_capture_helper(arch).await.expect("helper");
            assert!(helper.ends_with("arm/tcpdump"));
        }

        let err = fetcher.fetch_capture_helper("x86").await.unwrap_err();
        assert!(matches!(err, CageError::Dependency { .. }));
    }
}
