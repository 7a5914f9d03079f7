//! Outpost - transactional email engine entry point

use anyhow::{Context, Result};
use outpost_common::config::{Config, LoggingConfig};
use outpost_core::{
    DnsVerificationChecker, EventSink, LogSink, Mailer, SmtpRelayTransport, Stores, WebhookSink,
};
use outpost_storage::DatabasePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("loading configuration")?;
    init_logging(&config.logging);
    config.validate().context("validating configuration")?;

    info!(hostname = %config.server.hostname, "Starting Outpost...");

    let stores = match config.database.backend.as_str() {
        "postgres" => {
            let pool = DatabasePool::connect(&config.database).await?;
            Stores::database(pool)
        }
        _ => {
            warn!("Using in-memory storage; identities and templates are lost on restart");
            Stores::memory()
        }
    };

    let transport = Arc::new(SmtpRelayTransport::new(
        &config.smtp,
        Duration::from_millis(config.sending.attempt_timeout_ms),
    )?);
    let checker = Arc::new(DnsVerificationChecker::new(
        config.verification.txt_record_prefix.clone(),
    ));

    let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(LogSink)];
    if !config.events.endpoints.is_empty() {
        sinks.push(Arc::new(WebhookSink::new(&config.events)?));
        info!(
            endpoints = config.events.endpoints.len(),
            "Webhook event sink enabled"
        );
    }

    let mailer = Arc::new(Mailer::new(&config, stores, transport, checker, sinks)?);

    let shutdown = CancellationToken::new();
    let workers = mailer.start(shutdown.clone())?;

    let app = outpost_api::create_router(mailer.clone(), &config.api);
    let listener = tokio::net::TcpListener::bind(&config.api.bind)
        .await
        .with_context(|| format!("binding API server to {}", config.api.bind))?;
    info!(bind = %config.api.bind, "Starting API server");

    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!("API server error: {}", e);
        }
    });

    info!("Outpost started successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    if let Err(e) = api_handle.await {
        warn!("API server task ended abnormally: {}", e);
    }
    for handle in workers {
        if let Err(e) = handle.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    info!(
        queued = mailer.queue_depth(),
        "Outpost shutdown complete"
    );
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},outpost=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
