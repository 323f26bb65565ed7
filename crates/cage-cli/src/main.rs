use anyhow::{bail, Context};
use cage_adb::{list_devices, AdbRunner, DeviceTransport};
use cage_engine::{
    AaptResolver, AnalysisPipeline, DownloadFetcher, MonkeyDriver, PipelineConfig, SessionBackend,
    WipePolicy,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Analyse malware dynamically on a real device or emulator.
#[derive(Parser, Debug)]
#[command(name = "droidcage", version)]
struct Args {
    /// Device serial as per the output of `adb devices`; auto-selected
    /// when exactly one device is connected.
    #[arg(short = 's', value_name = "SERIAL")]
    serial: Option<String>,

    /// Path to the APK file under analysis.
    #[arg(short = 'p', value_name = "APK")]
    apk: PathBuf,

    /// Enable debug-level logging.
    #[arg(short = 'd')]
    debug: bool,

    /// Hook-definitions file consumed by the script generator.
    #[arg(long, value_name = "FILE", default_value = "hooks/hooks_def.json")]
    hooks: PathBuf,

    /// Storage root for task workspaces and cached server binaries.
    #[arg(long, value_name = "DIR", default_value = "droidcage_storage")]
    storage: PathBuf,

    /// Directory holding prebuilt capture helpers, one per architecture
    /// family.
    #[arg(long, value_name = "DIR", default_value = "utils/tcpdump")]
    helpers: PathBuf,

    /// What to do when a staging wipe step fails: skip or abort.
    #[arg(long, value_name = "POLICY", default_value = "skip")]
    wipe_policy: WipePolicy,
}

fn init_tracing(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Pick the device to run against. With no explicit serial: zero devices
/// waits until exactly one shows up, one device auto-selects, more than
/// one prints guidance and exits.
async fn resolve_serial(explicit: Option<String>) -> anyhow::Result<Option<String>> {
    if let Some(serial) = explicit {
        return Ok(Some(serial));
    }

    let runner = AdbRunner;
    let devices = list_devices(&runner).await?;
    match devices.as_slice() {
        [] => {
            println!("Waiting for a connected device...");
            loop {
                tokio::time::sleep(Duration::from_secs(2)).await;
                let devices = list_devices(&runner).await?;
                if let [serial] = devices.as_slice() {
                    return Ok(Some(serial.clone()));
                }
            }
        }
        [serial] => Ok(Some(serial.clone())),
        _ => {
            println!("More than one device is attached, try -s to specify a device serial");
            Ok(None)
        }
    }
}

#[cfg(feature = "frida")]
fn build_backend(serial: &str) -> anyhow::Result<Box<dyn SessionBackend>> {
    use cage_engine::frida_backend::FridaBackend;

    let backend = FridaBackend::new(serial)
        .map_err(|fault| anyhow::anyhow!("instrumentation backend unavailable: {fault:?}"))?;
    Ok(Box::new(backend))
}

#[cfg(not(feature = "frida"))]
fn build_backend(_serial: &str) -> anyhow::Result<Box<dyn SessionBackend>> {
    bail!(
        "the instrumentation backend is disabled in this build; \
         rebuild droidcage with `--features frida` to run analyses"
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    if !args.apk.is_file() {
        bail!("no APK at {}", args.apk.display());
    }

    let Some(serial) = resolve_serial(args.serial).await? else {
        return Ok(());
    };
    info!(%serial, "running against device");

    let backend = build_backend(&serial)?;
    let transport = Arc::new(DeviceTransport::new(serial));
    let fetcher = Arc::new(DownloadFetcher::new(
        args.storage.join("misc"),
        args.helpers,
    ));

    let config = PipelineConfig {
        analyses_dir: args.storage.join("analyses"),
        hooks_file: args.hooks,
        wipe_policy: args.wipe_policy,
        ..PipelineConfig::default()
    };

    let mut pipeline = AnalysisPipeline::new(
        transport,
        backend,
        fetcher,
        Arc::new(AaptResolver),
        Arc::new(MonkeyDriver::default()),
        args.apk,
        config,
    );

    pipeline
        .run()
        .await
        .context("analysis did not complete")?;

    if let Some(task) = pipeline.task() {
        info!(
            task = task.id,
            workspace = %task.root().display(),
            "evidence collected"
        );
    }
    Ok(())
}
