//! Ember Server - OpenAI-style chat completions with optional directory retrieval
//!
//! Startup order:
//! 1. Parse configuration from flags and environment variables.
//! 2. Initialise tracing.
//! 3. Optionally load a model.
//! 4. Serve HTTP until SIGINT or SIGTERM.

mod config;
mod error;
mod routes;

use std::sync::Arc;

use clap::Parser;
use ember_core::ServiceContext;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::parse();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => cfg.log_level.parse::<EnvFilter>().unwrap_or_else(|e| {
            eprintln!("WARN: EMBER_LOG='{}' is not a valid filter ({e}); falling back to 'info'", cfg.log_level);
            EnvFilter::new("info")
        }),
    };
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true);
    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "ember-server starting");

    let service = Arc::new(ServiceContext::new(cfg.service_config()));
    if let Some(model) = cfg.model.clone() {
        let loader = Arc::clone(&service);
        tokio::task::spawn_blocking(move || loader.init(&model)).await??;
        if let Some(stats) = service.stats() {
            info!(
                model = %stats.model_id,
                model_type = %stats.model_type,
                vocab_size = stats.vocab_size,
                "model ready"
            );
        }
    } else {
        info!("No model configured; POST /api/init to load one");
    }

    let app = routes::build(service);
    let addr = cfg.bind_address()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("ember-server stopped");
    Ok(())
}

/// Resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
