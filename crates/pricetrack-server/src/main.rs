mod api;
mod middleware;
mod scheduler;
mod tracking;

use std::sync::Arc;

use pricetrack_core::StoreBackend;
use pricetrack_db::Stores;
use pricetrack_fetcher::HttpPriceFetcher;
use tracing_subscriber::EnvFilter;

use crate::{
    api::{build_app, AppState},
    scheduler::Scheduler,
    tracking::PriceTrackingService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = pricetrack_core::load_app_config()?;
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.clone()))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    tracing::info!(
        env = %config.env,
        backend = %config.store_backend,
        "starting pricetrack-server",
    );

    let stores = match config.store_backend {
        StoreBackend::Postgres => {
            let pool_config = pricetrack_db::PoolConfig::from_app_config(&config);
            let pool = pricetrack_db::connect_pool(&config.database_url, pool_config).await?;
            let applied = pricetrack_db::run_migrations(&pool).await?;
            tracing::info!(applied, "migrations up to date");
            Stores::postgres(pool)
        }
        StoreBackend::Memory => {
            tracing::warn!("memory store backend selected; nothing will survive a restart");
            Stores::memory()
        }
    };

    let fetcher = HttpPriceFetcher::new(
        config.fetch_timeout_secs,
        &config.fetch_user_agent,
        config.fetch_max_retries,
        config.fetch_retry_backoff_base_secs,
    )?;

    let scheduler = Arc::new(Scheduler::new().await?);
    let service = Arc::new(PriceTrackingService::new(
        stores,
        Arc::new(fetcher),
        Arc::clone(&scheduler),
        config.default_cron.clone(),
    ));

    // Timers are not persisted; rebuild them from the Playing rows.
    service.reconcile().await?;
    {
        let service = Arc::clone(&service);
        scheduler
            .register_maintenance_job("reconcile", &config.reconcile_cron, move || {
                let service = Arc::clone(&service);
                async move {
                    if let Err(e) = service.reconcile().await {
                        tracing::error!(error = %e, "scheduler: reconcile pass failed");
                    }
                }
            })
            .await?;
    }
    scheduler.start().await?;

    let app = build_app(AppState { service });

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await?;
    Ok(())
}

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
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("received shutdown signal, starting graceful shutdown");
}
