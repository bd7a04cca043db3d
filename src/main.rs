//! Fuhlen battery monitor.
//!
//! Polls the battery level of a Fuhlen wireless receiver over USB at moments
//! when the peripheral is likely to answer, smooths the readings and exposes
//! them through two status files for bars and widgets.

mod activity;
mod config;
mod discovery;
mod error;
mod logging;
mod metrics;
mod monitor;
mod probe;
mod scheduler;
mod sink;
mod smoothing;

use activity::EvdevActivityMonitor;
use config::ConfigManager;
use discovery::{SysfsPaths, FUHLEN_RECEIVER};
use metrics::MonitorMetrics;
use monitor::{BatteryMonitor, TICK_INTERVAL};
use probe::{RetryPolicy, UsbBatteryProbe};
use sink::FileStatusSink;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Interval between metrics summaries in the log
const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _log_guard = logging::init_logging();

    info!("Fuhlen battery monitor starting...");

    let result = run_monitor().await;

    match &result {
        Ok(()) => info!("Fuhlen battery monitor shut down gracefully"),
        Err(e) => error!("Fuhlen battery monitor error: {}", e),
    }

    result
}

async fn run_monitor() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = ConfigManager::default_path();
    let config = ConfigManager::load_or_warn(&config_path).get();
    info!(
        "Publishing to {:?} and {:?} (config: {:?})",
        config.status_file, config.status_json_file, config_path
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    // Held so a failed signal handler cannot close the channel under the loop.
    let _shutdown_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = setup_signal_handlers(shutdown_tx).await {
            error!("Signal handler error: {}", e);
        }
    });

    let paths = SysfsPaths::default();
    let policy = RetryPolicy::default();
    info!(
        "Watching receiver {}, probe budget {:?} per read",
        FUHLEN_RECEIVER,
        policy.worst_case()
    );

    let metrics = Arc::new(MonitorMetrics::new());
    let mut monitor = BatteryMonitor::new(
        EvdevActivityMonitor::new(paths.clone(), FUHLEN_RECEIVER),
        UsbBatteryProbe::new(paths, FUHLEN_RECEIVER, policy),
        FileStatusSink::new(&config.status_file, &config.status_json_file),
        Arc::clone(&metrics),
        Instant::now(),
    );
    monitor.start();

    let mut last_report = Instant::now();

    loop {
        // Probing blocks for up to the retry budget; keep it off the async workers.
        let tick = tokio::task::block_in_place(|| {
            std::panic::catch_unwind(AssertUnwindSafe(|| monitor.tick(Instant::now())))
        });

        if tick.is_err() {
            metrics.record_tick_panic();
            error!("Panic during monitor tick, continuing operation");
        }

        if last_report.elapsed() >= METRICS_REPORT_INTERVAL {
            log_metrics(&metrics);
            last_report = Instant::now();
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Monitor loop shutting down");
                    break;
                }
            }
            _ = tokio::time::sleep(TICK_INTERVAL) => {}
        }
    }

    log_metrics(&metrics);
    Ok(())
}

fn log_metrics(metrics: &MonitorMetrics) {
    match serde_json::to_string(&metrics.snapshot()) {
        Ok(json) => info!("Monitor metrics: {}", json),
        Err(e) => warn!("Failed to serialize metrics: {}", e),
    }
}

/// Set up signal handlers for graceful shutdown.
/// Handles SIGTERM and SIGINT.
#[cfg(unix)]
async fn setup_signal_handlers(
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    let _ = shutdown_tx.send(true);
    Ok(())
}

#[cfg(not(unix))]
async fn setup_signal_handlers(
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    let _ = shutdown_tx.send(true);
    Ok(())
}
