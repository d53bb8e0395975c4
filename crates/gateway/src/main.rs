use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use warden_domain::config::{Config, ConfigSeverity};
use warden_gateway::cli::{Cli, Command};
use warden_gateway::{api, state};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Run) => {
            init_tracing();
            let (config, _config_path) = warden_gateway::cli::load_config()?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Migrate) => {
            println!(
                "warden migrate: no persistent state of its own to prepare — \
                 the relational config store is an external collaborator."
            );
            Ok(())
        }
    }
}

/// Structured JSON logging for the `run` path, the only long-running
/// command.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,warden_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("warden starting");

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        );
    }

    let app_state = state::build(config.clone());

    // Recover from a crashed prior run: stale locks and in-flight
    // markers would otherwise block new transitions forever. The
    // control plane is expected to re-mark desired states afterward.
    app_state.state_store.reset_all().await;
    tracing::info!("state store reset on startup");

    app_state.supervisor.start(
        app_state.reconciler.clone(),
        Duration::from_secs(config.reconciler.tick_interval_secs),
    );
    tracing::info!(
        tick_interval_secs = config.reconciler.tick_interval_secs,
        "lifecycle reconciler started"
    );

    let app = api::router(app_state.clone()).layer(TraceLayer::new_for_http());

    let addr = config.server.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "warden monitoring endpoint listening");

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining live bots");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("axum server error")?;

    app_state.supervisor.stop();
    for bot_id in app_state.supervisor.list_all() {
        app_state.supervisor.remove(&bot_id).await;
    }

    Ok(())
}
