// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

mod cli;
pub mod config;
mod controller;
mod handlers;
mod kubernetes;
pub mod report;

use anyhow::{Result, bail};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use cli::{Args, Command, ConfigAction};
use config::Config;
use controller::{ControllerOptions, ControllerSet, Source, stop_signal};
use kubernetes::KubeSource;
use report::{ControllerReport, ReportHandle};

/// Initialize logging to stderr, plus rotating files when a directory is given
fn init_logging(verbose: bool, log_dir: Option<&Path>) {
    use tracing_rolling_file::{RollingConditionBase, RollingFileAppenderBase};
    use tracing_subscriber::fmt::format::FmtSpan;

    let filter = if verbose {
        "kubewatch=debug"
    } else {
        "kubewatch=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::NONE);

    let file_layer = log_dir.and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: Could not create log directory: {}", e);
            return None;
        }

        // File appender with size-based rotation:
        // - Max 10MB per file
        // - Keep up to 5 files (total max ~50MB)
        // - Also rotate daily
        let condition = RollingConditionBase::new()
            .daily()
            .max_size(10 * 1024 * 1024); // 10MB
        let file_appender =
            match RollingFileAppenderBase::new(dir.join("kubewatch.log"), condition, 5) {
                Ok(appender) => appender,
                Err(e) => {
                    eprintln!("Warning: Could not create log file: {}", e);
                    return None;
                }
            };

        let (non_blocking, _guard) = file_appender.get_non_blocking_appender();
        // Leak the guard to keep the background writer alive
        std::mem::forget(_guard);

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_span_events(FmtSpan::NONE),
        )
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (aws-lc-rs)
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = Args::parse();
    init_logging(args.verbose, args.log_dir.as_deref());

    let path = Config::config_path(args.config.as_deref())?;

    match args.command.clone().unwrap_or(Command::Run) {
        Command::Config {
            action: ConfigAction::Init { force },
        } => {
            Config::init(&path, force)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Command::Config {
            action: ConfigAction::View,
        } => {
            let config = effective_config(&args, &path)?;
            print!("{}", config.to_yaml()?);
            Ok(())
        }
        Command::Run => run(&args, path).await,
    }
}

/// File settings with environment and command-line overrides applied
fn effective_config(args: &Args, path: &Path) -> Result<Config> {
    let mut config = Config::load(path)?;
    config.apply_env_overrides(|name| std::env::var(name).ok());
    if !args.namespaces.is_empty() {
        config.namespace = args.namespaces.clone();
    }
    Ok(config)
}

async fn run(args: &Args, path: PathBuf) -> Result<()> {
    let config = effective_config(args, &path)?;
    let resolved = config.resolve()?;
    info!(
        config = %path.display(),
        subscriptions = resolved.subscriptions.len(),
        handler = ?config.handler.kind,
        "Configuration loaded"
    );

    let client = kubernetes::connect(args.context.as_deref()).await?;
    let reports = report::create_report_handle();
    tokio::spawn(log_reports(reports.clone()));

    let options = ControllerOptions {
        sync_timeout: Duration::from_secs(args.sync_timeout),
        workers: usize::from(args.workers),
        ..ControllerOptions::default()
    };
    let set = ControllerSet::build(
        &resolved.subscriptions,
        |sub| {
            Arc::new(KubeSource::new(client.clone(), sub.resource, &sub.namespace))
                as Arc<dyn Source>
        },
        Arc::new(resolved.filters),
        handlers::from_config(&config.handler),
        reports.clone(),
        options,
    );

    let (stop_handle, stop) = stop_signal();
    tokio::spawn(async move {
        shutdown_signal().await;
        stop_handle.stop();
    });

    let summary = set.run(stop).await;
    if summary.started > 0 && summary.failed == summary.started {
        bail!("All {} subscriptions failed to start", summary.started);
    }
    if reports.errors() > 0 {
        warn!(errors = reports.errors(), "Stopped with reported errors");
    }
    Ok(())
}

/// Log every controller report until the reporter goes away
async fn log_reports(reports: ReportHandle) {
    use tokio::sync::broadcast::error::RecvError;

    let mut rx = reports.subscribe();
    drop(reports);
    loop {
        match rx.recv().await {
            Ok(ControllerReport::Starting {
                resource,
                namespace,
            }) => {
                info!(resource = %resource, namespace = %namespace, "Controller starting");
            }
            Ok(ControllerReport::Synced {
                resource,
                namespace,
                elapsed_ms,
            }) => {
                info!(resource = %resource, namespace = %namespace, elapsed_ms, "Controller synced");
            }
            Ok(ControllerReport::Stopped {
                resource,
                namespace,
            }) => {
                info!(resource = %resource, namespace = %namespace, "Controller stopped");
            }
            Ok(ControllerReport::SyncTimedOut {
                resource,
                namespace,
                timeout_ms,
            }) => {
                error!(
                    resource = %resource,
                    namespace = %namespace,
                    timeout_ms,
                    "Timed out waiting for caches to sync"
                );
            }
            Ok(ControllerReport::RetriesExhausted {
                resource,
                key,
                error,
            }) => {
                error!(
                    resource = %resource,
                    key = %key,
                    error = %error,
                    "Dropping change out of the queue"
                );
            }
            Ok(ControllerReport::MalformedObject { resource, reason }) => {
                error!(resource = %resource, reason = %reason, "Dropped malformed object");
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "Report subscriber lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
