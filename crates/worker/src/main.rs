//! `imagex-worker` -- SQS to ComfyUI intake daemon.
//!
//! Long-polls the job queue, runs each workflow on the local ComfyUI
//! server, optionally uploads the outputs to S3 and announces them on a
//! completion queue. Configuration comes from the environment (see
//! `imagex_worker::config::WorkerConfig::from_env`); a `.env` file is honoured.
//!
//! `RUST_LOG` overrides the default log filter and
//! `IMAGEX_LOG_FORMAT=json` switches to JSON log lines.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use imagex_core::status::{StatusRegistry, WorkerState};
use imagex_worker::backends::AwsComfyBackends;
use imagex_worker::supervisor::WorkerSupervisor;

/// How often the main task checks whether the worker halted on its own.
const WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// How often a status summary is logged.
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let supervisor = WorkerSupervisor::from_env(Arc::new(AwsComfyBackends));
    if let Err(e) = supervisor.start() {
        let snapshot = supervisor.snapshot();
        tracing::error!(
            state = %snapshot.state,
            last_error = snapshot.last_error.as_deref().unwrap_or(""),
            error = %e,
            "Failed to start worker",
        );
        std::process::exit(1);
    }

    tokio::select! {
        () = shutdown_signal() => {}
        () = watch(supervisor.status()) => {
            tracing::warn!("Worker halted without a shutdown request");
        }
    }

    supervisor.stop().await;

    let snapshot = supervisor.snapshot();
    tracing::info!(
        state = %snapshot.state,
        jobs_succeeded = snapshot.jobs_succeeded,
        jobs_retried = snapshot.jobs_retried,
        jobs_failed = snapshot.jobs_failed,
        jobs_dead_lettered = snapshot.jobs_dead_lettered,
        "Shutdown complete",
    );

    if snapshot.state == WorkerState::ConfigError {
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "imagex_worker=info,imagex_comfyui=info,imagex_cloud=info".into());

    let json = std::env::var("IMAGEX_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Resolve once the worker is no longer active, logging a status summary
/// every [`STATUS_LOG_INTERVAL`] while it runs.
async fn watch(status: Arc<StatusRegistry>) {
    let mut ticker = tokio::time::interval(WATCH_INTERVAL);
    let mut last_report = tokio::time::Instant::now();

    loop {
        ticker.tick().await;

        let snapshot = status.snapshot();
        if !snapshot.state.is_active() {
            return;
        }

        if last_report.elapsed() >= STATUS_LOG_INTERVAL {
            last_report = tokio::time::Instant::now();
            tracing::info!(
                state = %snapshot.state,
                uptime_secs = snapshot.uptime_secs.unwrap_or_default(),
                jobs_succeeded = snapshot.jobs_succeeded,
                jobs_retried = snapshot.jobs_retried,
                jobs_dead_lettered = snapshot.jobs_dead_lettered,
                last_error = snapshot.last_error.as_deref().unwrap_or(""),
                "Worker status",
            );
        }
    }
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
///
/// If a handler cannot be installed the error is logged and that signal
/// is ignored; the other one still works.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
