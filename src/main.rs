use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use mediagen::app::{AppConfig, AppState};
use mediagen::cli::{self, Cli};
use mediagen::platform::AppPaths;

/// Human-readable logs go to stderr so stdout stays valid JSON.
fn init_logging(paths: &AppPaths, debug: bool) -> Option<WorkerGuard> {
    let default_directive = if debug { "mediagen=debug" } else { "mediagen=info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = match std::fs::create_dir_all(paths.logs_dir()) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(paths.logs_dir(), "mediagen.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = match &cli.config {
        Some(file) => {
            let file = PathBuf::from(file);
            AppPaths::rooted_at(file.parent().map(PathBuf::from).unwrap_or_default())
        }
        None => AppPaths::new()?,
    };
    let log_guard = init_logging(&paths, cli.debug);
    info!("Starting mediagen {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(file) => AppConfig::load_from(&PathBuf::from(file)).await?,
        None => {
            paths.ensure_dirs_exist()?;
            AppConfig::load(&paths).await?
        }
    };
    let state = AppState::new(config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight work");
            on_interrupt.cancel();
        }
    });

    let output = cli::execute(cli.command, &state, cancel).await?;
    println!("{}", serde_json::to_string_pretty(&output.json)?);

    if !output.success {
        drop(log_guard);
        std::process::exit(1);
    }
    Ok(())
}
