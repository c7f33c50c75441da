use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use eslog_core::config::EslogConfig;
use eslog_daemon::cli::DaemonCli;
use eslog_daemon::{logging, metrics_server, plugin_api};
use eslog_log_pipeline::bulk::elasticsearch::ElasticsearchFactory;
use eslog_log_pipeline::{LogDriver, PipelineConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    let mut config = EslogConfig::load_or_default(&cli.config)
        .await
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.general.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }
    if let Some(socket) = cli.socket {
        config.plugin.socket_path = socket;
    }
    config.validate().context("invalid configuration")?;

    if cli.validate {
        println!("configuration OK: {}", cli.config.display());
        return Ok(());
    }

    logging::init_tracing(&config.general)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "eslog-daemon starting");

    if config.metrics.enabled {
        metrics_server::install_metrics_recorder(&config.metrics)?;
    }

    let driver = Arc::new(LogDriver::new(
        ElasticsearchFactory,
        PipelineConfig::from_core(&config.pipeline),
    ));

    let listener = plugin_api::bind(&config.plugin.socket_path)
        .with_context(|| format!("failed to bind plugin socket {}", config.plugin.socket_path))?;
    tracing::info!(socket = %config.plugin.socket_path, "plugin API listening");

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(plugin_api::serve(
        listener,
        Arc::clone(&driver),
        shutdown.clone(),
    ));

    wait_for_signal().await?;
    tracing::info!("shutdown signal received");

    // Stop taking requests before flushing streams.
    shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "plugin API failed"),
        Err(e) => tracing::error!(error = %e, "plugin API task panicked"),
    }

    let grace = Duration::from_secs(config.plugin.shutdown_timeout_secs);
    if !driver.shutdown(grace).await {
        tracing::warn!("some streams were cancelled before their final flush");
    }

    if let Err(e) = std::fs::remove_file(&config.plugin.socket_path) {
        tracing::debug!(error = %e, "could not remove plugin socket");
    }

    tracing::info!("eslog-daemon shut down");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
