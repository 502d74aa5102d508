#![deny(unsafe_op_in_unsafe_fn)]

use std::panic;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rfdeck_daemon::config::DaemonConfig;
use rfdeck_daemon::state::DaemonState;
use rfdeck_daemon::{server, socket};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let config = DaemonConfig::from_env();
    let log_cfg = rfdeck_logging::fs::read_config(&config.root_path);
    let _logging_guards = rfdeck_logging::init("rfdeckd", &config.root_path, &log_cfg)?;

    install_panic_hook();

    let _log_watcher = match rfdeck_logging::spawn_watcher(&config.root_path) {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!("Logging watcher disabled: {}", err);
            None
        }
    };

    let span = tracing::info_span!("rfdeckd", component = "rfdeckd");
    let _span_guard = span.enter();

    let state = Arc::new(DaemonState::new(config.clone())?);
    let listener = socket::bind(&config.socket_path)
        .with_context(|| format!("binding {}", config.socket_path.display()))?;

    let global_cancel = CancellationToken::new();
    spawn_retention_task(config.root_path.clone(), global_cancel.clone());

    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = Arc::clone(&shutdown);
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to register SIGTERM handler: {}", err);
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to register SIGINT handler: {}", err);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            },
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            },
        }

        shutdown_signal.notify_waiters();
    });

    info!(
        sweep_program = %config.sweep.program,
        tools = state.tools.names().count(),
        "rfdeckd ready"
    );
    server::run(listener, Arc::clone(&state), Arc::clone(&shutdown)).await;

    info!("Starting graceful shutdown...");
    global_cancel.cancel();

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, state.shutdown())
        .await
        .is_err()
    {
        error!("Shutdown did not finish within {:?}", SHUTDOWN_TIMEOUT);
    }
    if let Err(err) = std::fs::remove_file(&config.socket_path) {
        warn!("Failed to remove socket {}: {}", config.socket_path.display(), err);
    }

    info!("rfdeckd stopped");
    Ok(())
}

fn spawn_retention_task(root: PathBuf, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Log retention task stopped by shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    let cfg = rfdeck_logging::fs::read_config(&root);
                    if let Err(err) = rfdeck_logging::run_retention(&root, &cfg) {
                        warn!("Log retention failed: {}", err);
                    }
                }
            }
        }
    });
}

/// Logs panics with location and backtrace before the default hook runs.
fn install_panic_hook() {
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        let backtrace = std::backtrace::Backtrace::capture();
        error!(
            target: "rfdeckd::panic",
            location = %location,
            message = %message,
            "PANIC: daemon panicked"
        );
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            error!(target: "rfdeckd::panic", backtrace = %backtrace, "Panic backtrace");
        } else {
            error!(
                target: "rfdeckd::panic",
                "Backtrace not available (set RUST_BACKTRACE=1 to enable)"
            );
        }

        default_hook(panic_info);
    }));
}
