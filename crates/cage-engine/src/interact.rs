//! The UI-exploration collaborator: drive the target application for a
//! bounded window while the monitors capture. Opaque to the pipeline.

use async_trait::async_trait;
use cage_adb::DeviceTransport;
use cage_core::Result;
use std::time::Duration;
use tracing::info;

#[async_trait]
pub trait InteractionDriver: Send + Sync {
    async fn interact(
        &self,
        transport: &DeviceTransport,
        package: &str,
        window: Duration,
    ) -> Result<()>;
}

/// Drives the target with the on-device monkey exerciser, throttled so the
/// event stream spans the interaction window.
pub struct MonkeyDriver {
    pub throttle: Duration,
}

impl Default for MonkeyDriver {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl InteractionDriver for MonkeyDriver {
    async fn interact(
        &self,
        transport: &DeviceTransport,
        package: &str,
        window: Duration,
    ) -> Result<()> {
        let events = (window.as_millis() / self.throttle.as_millis().max(1)).max(1);
        info!(package, events, "interacting with the target application");
        transport
            .shell(&[
                "monkey",
                "-p",
                package,
                "--throttle",
                &self.throttle.as_millis().to_string(),
                "--ignore-crashes",
                "--ignore-timeouts",
                &events.to_string(),
            ])
            .await?;
        Ok(())
    }
}

/// Does nothing but hold the window open; useful when a human drives the
/// device.
pub struct IdleDriver;

#[async_trait]
impl InteractionDriver for IdleDriver {
    async fn interact(
        &self,
        _transport: &DeviceTransport,
        package: &str,
        window: Duration,
    ) -> Result<()> {
        info!(package, ?window, "idle interaction window");
        tokio::time::sleep(window).await;
        Ok(())
    }
}
