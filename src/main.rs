//! Database backup service
//!
//! Dumps a database on a schedule or on demand, stores the artifact on local
//! and/or S3-compatible storage, prunes old artifacts by retention policy and
//! restores a chosen artifact back to disk.

// dbbackup/src/main.rs
mod backup;
mod config;
mod errors;
mod orchestrator;
mod restore;
mod retention;
mod scheduler;
mod server;
mod storage;
mod utils;

use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use config::{Action, AppConfig};
use orchestrator::{Orchestrator, RunStatus, TriggerSource};
use scheduler::Scheduler;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {}", e);
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = match utils::logging::init(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run_app(config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(config: AppConfig) -> Result<ExitCode> {
    info!("Starting dbbackup for '{}'", config.name);
    config.log_summary();
    let orchestrator = Arc::new(
        Orchestrator::from_config(&config)
            .await
            .context("Failed to set up storage")?,
    );

    match config.action {
        Action::Restore => {
            let restore_path = config
                .restore_path
                .as_deref()
                .context("Restore selected without a restore path")?;
            match orchestrator.run_restore(&config.restore_target, restore_path).await {
                Ok(placed) => {
                    info!("Restored into {}. Exiting.", placed.display());
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    error!("{}", e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Action::Backup if config.schedule.is_some() || config.listen_addr.is_some() => {
            run_service(&config, orchestrator).await
        }
        Action::Backup => {
            let run = orchestrator.run_backup(TriggerSource::OneShot).await;
            info!(status = ?run.status(), "Backup complete. Exiting.");
            Ok(match run.status() {
                RunStatus::Failed => ExitCode::FAILURE,
                RunStatus::Succeeded | RunStatus::PartiallyFailed => ExitCode::SUCCESS,
            })
        }
    }
}

/// Runs the scheduler and the trigger listener until a shutdown signal.
async fn run_service(config: &AppConfig, orchestrator: Arc<Orchestrator>) -> Result<ExitCode> {
    let shutdown = CancellationToken::new();
    let scheduler = Scheduler::start(orchestrator, config.schedule, shutdown.clone());
    let mut listener = config
        .listen_addr
        .map(|addr| tokio::spawn(server::serve(addr, scheduler.handle(), shutdown.clone())));

    let listener_exit = tokio::select! {
        _ = shutdown_signal() => None,
        exit = wait_listener(listener.as_mut()) => Some(exit),
    };
    info!("Exiting...");
    shutdown.cancel();

    let code = match listener_exit {
        Some(exit) => {
            log_listener_exit(exit);
            ExitCode::FAILURE
        }
        None => {
            if let Some(task) = listener {
                log_listener_exit(task.await);
            }
            ExitCode::SUCCESS
        }
    };
    scheduler.wait().await;
    Ok(code)
}

async fn wait_listener(
    listener: Option<&mut JoinHandle<Result<()>>>,
) -> Result<Result<()>, tokio::task::JoinError> {
    match listener {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

fn log_listener_exit(exit: Result<Result<()>, tokio::task::JoinError>) {
    match exit {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{:#}", e),
        Err(e) => error!("HTTP listener task failed: {}", e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
