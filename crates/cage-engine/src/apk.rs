//! Resolve the package name an APK installs as, via `aapt dump badging`.

use async_trait::async_trait;
use cage_core::{CageError, Result};
use std::io;
use std::path::Path;
use tokio::process::Command;

/// Maps an APK on disk to the package name it installs as. The pipeline
/// only depends on this seam; the shipped implementation shells `aapt`.
#[async_trait]
pub trait PackageResolver: Send + Sync {
    async fn package_name(&self, apk: &Path) -> Result<String>;
}

#[derive(Debug, Default)]
pub struct AaptResolver;

#[async_trait]
impl PackageResolver for AaptResolver {
    async fn package_name(&self, apk: &Path) -> Result<String> {
        let output = Command::new("aapt")
            .args(["dump", "badging"])
            .arg(apk)
            .output()
            .await
            .map_err(|err| {
                if err.kind() == io::ErrorKind::NotFound {
                    CageError::dependency("aapt", "binary not found in PATH")
                } else {
                    CageError::command("aapt dump badging", err.to_string())
                }
            })?;

        if !output.status.success() {
            return Err(CageError::command(
                "aapt dump badging",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_badging(&stdout).ok_or_else(|| {
            CageError::command(
                "aapt dump badging",
                format!("no package name in badging output for {}", apk.display()),
            )
        })
    }
}

/// Pick `name='…'` out of the `package:` badging line.
fn parse_badging(output: &str) -> Option<String> {
    let line = output.lines().find(|line| line.starts_with("package:"))?;
    let name_field = line
        .split_whitespace()
        .find(|field| field.starts_with("name="))?;
    let quoted = name_field.strip_prefix("name=")?;
    let name = quoted.trim_matches('\'');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_name_is_read_from_the_badging_line() {
        let output = concat!(
            "package: name='com.example.app' versionCode='7' versionName='1.2'\n",
            "sdkVersion:'21'\n",
            "application-label:'Example'\n",
        );
        assert_eq!(parse_badging(output).as_deref(), Some("com.example.app"));
    }

    #[test]
    fn missing_package_line_yields_none() {
        assert_eq!(parse_badging("sdkVersion:'21'\n"), None);
        assert_eq!(parse_badging(""), None);
    }
}
