use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use storefront_reconciler::api;
use storefront_reconciler::cache::{init_cache_pool, DedupeGate, RedisIdempotencyCache};
use storefront_reconciler::config::AppConfig;
use storefront_reconciler::database::{init_pool, run_migrations, PgLedger, PoolConfig};
use storefront_reconciler::logging::init_tracing;
use storefront_reconciler::payments::providers::PayPalProvider;
use storefront_reconciler::payments::PaymentGateway;
use storefront_reconciler::services::{
    CheckoutService, PaymentSyncService, ReconciliationEngine, WebhookProcessor,
};
use storefront_reconciler::workers::ReconciliationScanner;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
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

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    config.validate()?;
    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting storefront reconciler"
    );

    let db_pool = init_pool(&config.database.url, Some(PoolConfig::from(&config.database)))
        .await
        .map_err(|e| {
            error!("Failed to initialize database pool: {}", e);
            e
        })?;
    run_migrations(&db_pool).await?;
    info!(
        max_connections = db_pool.options().get_max_connections(),
        "Database connection pool initialized"
    );

    let cache_pool = init_cache_pool(config.cache.to_pool_config())
        .await
        .map_err(|e| {
            error!("Failed to initialize cache pool: {}", e);
            e
        })?;
    let idempotency = Arc::new(RedisIdempotencyCache::new(cache_pool));
    info!(redis_url = %config.cache.redis_url, "Cache connection pool initialized");

    let gateway: Arc<dyn PaymentGateway> = Arc::new(PayPalProvider::new(config.paypal.api.clone())?);
    let recon = &config.reconciliation;
    let engine = Arc::new(ReconciliationEngine::new(
        Arc::new(PgLedger::new(db_pool)),
        recon.engine_config(),
    ));
    let sync = Arc::new(PaymentSyncService::new(
        engine.clone(),
        gateway.clone(),
        recon.sync_config(),
    ));
    let webhook_gate = DedupeGate::new(
        idempotency.clone(),
        recon.webhook_replay_ttl(),
        recon.webhook_processing_ceiling(),
    );
    let processor = Arc::new(WebhookProcessor::new(
        gateway.clone(),
        sync.clone(),
        webhook_gate,
        config.paypal.webhook_config(),
    ));

    let checkout = Arc::new(CheckoutService::new(
        engine.clone(),
        gateway.clone(),
        sync.clone(),
        DedupeGate::new(
            idempotency.clone(),
            recon.checkout_registration_ttl(),
            recon.checkout_registration_ttl(),
        ),
    ));

    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let scanner = ReconciliationScanner::new(sync.clone(), recon.scanner_config());
    let scanner_handle = tokio::spawn(scanner.run(worker_shutdown_rx));

    let app = api::router(processor, checkout);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;
    info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), scanner_handle)
        .await
        .is_err()
    {
        error!("Timed out waiting for reconciliation scanner shutdown");
    }

    info!("Server shutdown complete");
    Ok(())
}
