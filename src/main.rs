use anyhow::Context;
use dotenv::dotenv;
use paygate_backend::api::{self, AppState};
use paygate_backend::cache::lock::RedisLock;
use paygate_backend::cache::sequence::RedisSequence;
use paygate_backend::cache::{self, RedisPool};
use paygate_backend::config::AppConfig;
use paygate_backend::database;
use paygate_backend::gateway::registry::ClientRegistry;
use paygate_backend::logging::init_tracing;
use paygate_backend::services::app::AppService;
use paygate_backend::services::notify::NotifyService;
use paygate_backend::services::order::OrderService;
use paygate_backend::services::refund::RefundService;
use paygate_backend::services::transfer::TransferService;
use paygate_backend::services::wallet::WalletService;
use paygate_backend::services::Stores;
use paygate_backend::workers::notify_dispatcher::NotifyDispatcher;
use paygate_backend::workers::reconciliation::{OrderReconcileWorker, RefundReconcileWorker};
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

fn build_state(
    config: &AppConfig,
    pool: PgPool,
    cache_pool: RedisPool,
) -> anyhow::Result<(AppState, Arc<NotifyService>)> {
    let stores = Stores::postgres(pool.clone());
    let registry = Arc::new(ClientRegistry::builtin());
    let lock = Arc::new(RedisLock::new(cache_pool.clone()));
    let sequence = Arc::new(RedisSequence::new(cache_pool.clone()));

    let apps = Arc::new(AppService::new(stores.clone(), registry));
    let wallets = Arc::new(WalletService::new(stores.clone()));
    let notify = Arc::new(
        NotifyService::new(stores.clone(), lock, &config.notify)
            .context("failed to initialize notify dispatcher")?,
    );
    let base_url = config.server.public_base_url.clone();
    let orders = Arc::new(OrderService::new(
        stores.clone(),
        apps.clone(),
        wallets.clone(),
        notify.clone(),
        sequence.clone(),
        base_url.clone(),
    ));
    let refunds = Arc::new(RefundService::new(
        stores.clone(),
        apps.clone(),
        wallets.clone(),
        notify.clone(),
        sequence.clone(),
        base_url.clone(),
    ));
    let transfers = Arc::new(TransferService::new(
        stores,
        apps.clone(),
        wallets,
        notify.clone(),
        sequence,
        base_url,
    ));

    Ok((
        AppState {
            apps,
            orders,
            refunds,
            transfers,
            pool,
            cache: cache_pool,
        },
        notify,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = AppConfig::from_env().context("failed to load configuration")?;
    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting payment gateway service"
    );

    let pool = database::init_pool(&config.database)
        .await
        .context("failed to initialize database pool")?;
    database::health_check(&pool)
        .await
        .context("database health check failed")?;

    let cache_pool = cache::init_cache_pool(&config.cache)
        .await
        .context("failed to initialize Redis pool")?;

    let (state, notify) = build_state(&config, pool, cache_pool)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = tokio::spawn(
        NotifyDispatcher::new(notify, config.notify.interval_secs).run(shutdown_rx.clone()),
    );
    let order_reconciler = tokio::spawn(
        OrderReconcileWorker::new(state.orders.clone(), &config.reconcile)
            .run(shutdown_rx.clone()),
    );
    let refund_reconciler = tokio::spawn(
        RefundReconcileWorker::new(state.refunds.clone(), &config.reconcile).run(shutdown_rx),
    );

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, public_base_url = %config.server.public_base_url, "HTTP server listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(dispatcher, order_reconciler, refund_reconciler);
    info!("Shutdown complete");
    Ok(())
}
