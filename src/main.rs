use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use clause_engine::preflight::host_owner;
use clause_engine::{
    BridgeConfig, DockerCli, HealthMonitor, LifecycleConfig, LifecycleManager, QueryBridge,
    StatusAggregator, SwishClient,
};
use clause_server::{HandlerState, ServerConfig};
use clause_settings::ClauseSettings;
use clause_store::DocumentStore;
use clause_telemetry::{init_telemetry, parse_level, TelemetryConfig};
use tokio_util::sync::CancellationToken;

/// Managed Prolog knowledge service backed by a SWISH container.
#[derive(Debug, Parser)]
#[command(name = "clause", version)]
struct Cli {
    /// Settings file (defaults to ~/.clause/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serve line-delimited RPC on stdin/stdout instead of HTTP.
    #[arg(long)]
    stdio: bool,

    /// Override the HTTP port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => clause_settings::load_settings_from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => clause_settings::load_settings().context("loading settings")?,
    };
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let telemetry = Arc::new(init_telemetry(TelemetryConfig {
        log_level: parse_level(&settings.logging.level).unwrap_or(tracing::Level::INFO),
        module_levels: Vec::new(),
        persist_warnings: settings.logging.persist_warnings,
        log_db_path: settings.log_db_path(),
    }));
    let adjustments = settings.validate();
    if !adjustments.is_empty() {
        tracing::warn!(count = adjustments.len(), "settings adjusted at startup");
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        container = %settings.container.name,
        image = %settings.container.image,
        "starting clause"
    );

    let state = build_state(&settings, Arc::clone(&telemetry))?;
    let cancel = CancellationToken::new();
    let monitor = HealthMonitor::spawn(
        Arc::clone(&state.lifecycle),
        settings.lifecycle.monitor_interval(),
        cancel.clone(),
    );

    if cli.stdio {
        let reader = tokio::io::BufReader::new(tokio::io::stdin());
        let served = clause_server::stdio::serve_stdio(Arc::clone(&state), reader, tokio::io::stdout());
        tokio::select! {
            result = served => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "stdio transport failed");
                }
            }
            () = shutdown_signal() => {}
        }
    } else {
        let config = ServerConfig {
            host: settings.server.host.clone(),
            port: settings.server.port,
            request_timeout: std::time::Duration::from_millis(settings.server.request_timeout_ms),
        };
        let handle = clause_server::server::start(config, Arc::clone(&state))
            .await
            .context("starting rpc server")?;
        tracing::info!(port = handle.port, "clause ready");
        shutdown_signal().await;
        handle.shutdown().await;
    }

    tracing::info!("shutting down");
    state.lifecycle.begin_shutdown();
    cancel.cancel();
    if let Err(e) = monitor.await {
        tracing::warn!(error = %e, "health monitor task failed");
    }

    let deadline = settings.lifecycle.shutdown_timeout();
    match tokio::time::timeout(deadline, state.lifecycle.teardown()).await {
        Ok(Ok(())) => tracing::info!("container stopped"),
        Ok(Err(e)) => tracing::error!(code = e.code(), error = %e, "teardown failed"),
        Err(_) => tracing::error!(
            container = %state.lifecycle.container_name(),
            timeout_secs = deadline.as_secs(),
            "teardown timed out, container may still be running"
        ),
    }
    Ok(())
}

fn build_state(
    settings: &ClauseSettings,
    telemetry: Arc<clause_telemetry::TelemetryGuard>,
) -> anyhow::Result<Arc<HandlerState>> {
    let engine = Arc::new(DockerCli::new(settings.lifecycle.engine_timeout()));
    let interpreter = Arc::new(SwishClient::new(settings.container.https));
    let spec = settings.container.to_spec(Some(host_owner()));

    let data_dir = settings.container.data_dir_path();
    let store = Arc::new(
        DocumentStore::open(&data_dir)
            .with_context(|| format!("opening document store at {}", data_dir.display()))?,
    );

    let lifecycle = LifecycleManager::new(
        engine,
        interpreter.clone(),
        spec,
        LifecycleConfig::from_settings(settings),
    );
    let bridge = Arc::new(QueryBridge::new(
        Arc::clone(&lifecycle),
        interpreter.clone(),
        Arc::clone(&store),
        BridgeConfig::from_settings(settings),
    ));
    let status = Arc::new(StatusAggregator::new(
        Arc::clone(&lifecycle),
        interpreter,
        std::time::Duration::from_millis(settings.status.probe_timeout_ms),
    ));

    Ok(Arc::new(
        HandlerState::new(lifecycle, bridge, status, store).with_telemetry(telemetry),
    ))
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
