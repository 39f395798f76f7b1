//! QSCAN daemon entrypoint

#[cfg(not(feature = "camera"))]
compile_error!("qscand requires the `camera` feature");

use anyhow::Context;
use clap::Parser;
use qscan::capture::{self, BackendKind, subprocess};
use qscan::config::MetricsFormat;
#[cfg(target_family = "unix")]
use qscan::output::unix::UnixBroadcast;
use qscan::output::{ConsoleSink, FanoutSink, ReportSink};
use qscan::{QscanConfig, ScanCoordinator, logging, metrics};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "qscand",
    version,
    about = "Continuously scan a camera for QR codes and report new payloads"
)]
struct Cli {
    /// Optional configuration file (toml/yaml). Defaults to qscan.{toml,yaml} in cwd/XDG config.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override camera by index (/dev/videoN)
    #[arg(long, value_name = "INDEX")]
    device_index: Option<usize>,

    /// Capture backends in preference order (v4l2, subprocess, replay); repeatable
    #[arg(long = "backend", value_name = "NAME")]
    backends: Vec<BackendKind>,

    /// Replay images from a directory instead of using a camera
    #[arg(long, value_name = "DIR")]
    replay: Option<PathBuf>,

    /// Print reports as JSON lines instead of human-readable text
    #[arg(long)]
    json: bool,

    /// Publish reports over the specified Unix domain socket path
    #[arg(long, value_name = "PATH")]
    unix_socket: Option<PathBuf>,

    /// Enable metrics output regardless of configuration file settings
    #[arg(long)]
    metrics: bool,

    /// Override metrics endpoint bind address (e.g. 127.0.0.1:9900)
    #[arg(long, value_name = "ADDR")]
    metrics_bind: Option<SocketAddr>,

    /// Override metrics endpoint format (`json` or `prometheus`)
    #[arg(long, value_name = "FORMAT")]
    metrics_format: Option<MetricsFormat>,

    /// Exit after the first reported code
    #[arg(long)]
    scan_once: bool,

    /// Capture and decode in separate tasks, skipping frames the decoder cannot keep up with
    #[arg(long)]
    pipelined: bool,

    /// List detected cameras and exit
    #[arg(long)]
    list_cameras: bool,

    /// List still-capture utilities found on the search path and exit
    #[arg(long)]
    list_utilities: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = QscanConfig::load(cli.config.as_deref())?;
    apply_cli(&mut config, &cli);

    if cli.list_cameras {
        return list_cameras();
    }
    if cli.list_utilities {
        list_utilities(&config);
        return Ok(());
    }

    let _log_guard = logging::init(&config.logging)?;

    if config.logging.metrics || config.logging.metrics_endpoint.is_some() {
        metrics::enable(config.logging.metrics_interval_secs);
        if let Some(endpoint) = &config.logging.metrics_endpoint {
            let addr: SocketAddr = endpoint
                .parse()
                .with_context(|| format!("Invalid metrics endpoint '{endpoint}'"))?;
            metrics::spawn_http_endpoint(addr, config.logging.metrics_format)?;
        }
    }

    let sink = build_sink(&config).await?;
    let mut coordinator = ScanCoordinator::from_config(&config, sink)?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    info!(
        backends = ?config.capture.backends,
        device_index = config.camera.device_index.unwrap_or(0),
        pipelined = config.scan.pipelined,
        "Starting QSCAN scanner"
    );

    if cli.scan_once {
        match coordinator.scan_once(&cancel).await {
            Ok(Some(report)) => {
                info!(payload = %report.payload, "Single scan complete");
                Ok(())
            }
            Ok(None) => {
                info!("Cancelled before a code was seen");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Scanner stopped");
                Err(err.into())
            }
        }
    } else {
        match coordinator.run(&cancel).await {
            Ok(summary) => {
                info!(
                    frames = summary.frames,
                    reports = summary.reports,
                    reselections = summary.acquisition.reselections,
                    "Scanner shut down"
                );
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Scanner stopped");
                Err(err.into())
            }
        }
    }
}

fn apply_cli(config: &mut QscanConfig, cli: &Cli) {
    if let Some(index) = cli.device_index {
        config.camera.device_index = Some(index);
    }
    if !cli.backends.is_empty() {
        config.capture.backends = cli.backends.clone();
    }
    if let Some(dir) = &cli.replay {
        config.capture.replay_dir = Some(dir.clone());
        if cli.backends.is_empty() {
            config.capture.backends = vec![BackendKind::Replay];
        }
    }
    if cli.json {
        config.output.json = true;
    }
    if let Some(path) = &cli.unix_socket {
        config.output.unix_socket = Some(path.clone());
    }
    if cli.metrics {
        config.logging.metrics = true;
    }
    if let Some(bind) = cli.metrics_bind {
        config.logging.metrics_endpoint = Some(bind.to_string());
        config.logging.metrics = true;
    }
    if let Some(format) = cli.metrics_format {
        config.logging.metrics_format = format;
    }
    if cli.pipelined {
        config.scan.pipelined = true;
    }
}

async fn build_sink(config: &QscanConfig) -> anyhow::Result<Arc<dyn ReportSink>> {
    let mut fanout = FanoutSink::new();
    fanout.push(Arc::new(ConsoleSink::from_flag(config.output.json)));

    #[cfg(target_family = "unix")]
    if let Some(path) = &config.output.unix_socket {
        let broadcast = UnixBroadcast::bind(path)
            .await
            .with_context(|| format!("Unix socket {}", path.display()))?;
        fanout.push(broadcast);
    }

    Ok(Arc::new(fanout))
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
                        _ = terminate.recv() => info!("Terminated, shutting down"),
                    }
                }
                Err(err) => {
                    error!(error = %err, "SIGTERM handler unavailable");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Interrupted, shutting down");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Interrupted, shutting down");
        }
        cancel.cancel();
    });
}

fn list_cameras() -> anyhow::Result<()> {
    let devices = capture::list_devices()?;
    println!("Discovered cameras:");
    for dev in devices {
        println!("  [{}] {} ({}, driver {})", dev.index, dev.name, dev.path, dev.driver);
    }
    Ok(())
}

fn list_utilities(config: &QscanConfig) {
    let search_path = config
        .capture
        .utility_search_path
        .clone()
        .unwrap_or_else(subprocess::system_search_path);

    println!("Still-capture utilities (in preference order):");
    for (utility, location) in subprocess::available_utilities(&search_path) {
        match location {
            Some(path) => println!("  [x] {:<16} {}", utility.program(), path.display()),
            None => println!("  [ ] {:<16} not installed", utility.program()),
        }
    }
}

