use std::{future::IntoFuture, process, sync::Arc, time::Duration};

use axum::{Router, middleware};
use pagecache::{
    cache::{
        CacheState, CacheStore, ContentVersionLedger, MemcachedStore, MemoryLedger, MemoryStore,
        StoreHandle, clear_cache, response_cache_layer,
    },
    config::{self, StoreBackend},
    error::AppError,
    infra::{
        db::PostgresLedger,
        error::InfraError,
        proxy::{UpstreamProxy, proxy_handler},
        telemetry,
    },
};
use tokio::sync::oneshot;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::ClearCache(_) => run_clear_cache(settings).await,
    }
}

fn build_store(settings: &config::StoreSettings) -> Arc<dyn CacheStore> {
    match &settings.backend {
        StoreBackend::Memory { capacity } => {
            info!(capacity = capacity.get(), "using in-process cache store");
            Arc::new(MemoryStore::new(capacity.get()))
        }
        StoreBackend::Memcached { addr } => {
            info!(%addr, "using memcached cache store");
            Arc::new(MemcachedStore::new(addr.clone()))
        }
    }
}

async fn build_ledger(
    settings: &config::DatabaseSettings,
) -> Result<Arc<dyn ContentVersionLedger>, AppError> {
    let Some(url) = settings.url.as_deref() else {
        warn!("no ledger database configured; content versions reset on restart");
        return Ok(Arc::new(MemoryLedger::new()));
    };

    let pool = PostgresLedger::connect(url, settings.max_connections.get())
        .await
        .map_err(InfraError::from)?;
    PostgresLedger::run_migrations(&pool)
        .await
        .map_err(InfraError::from)?;
    let ledger = PostgresLedger::new(pool);
    ledger.health_check().await.map_err(InfraError::from)?;
    info!("connected to ledger database");
    Ok(Arc::new(ledger))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let store = StoreHandle::new(build_store(&settings.store), settings.store.timeout);
    let ledger = build_ledger(&settings.database).await?;
    let cache_state = CacheState::new(settings.cache.clone(), store, ledger);

    let proxy = UpstreamProxy::new(settings.upstream.base_url.clone(), settings.upstream.timeout)?;
    let router = Router::new()
        .fallback(proxy_handler)
        .with_state(proxy)
        .layer(middleware::from_fn_with_state(
            cache_state,
            response_cache_layer,
        ));

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;
    info!(
        addr = %settings.server.addr,
        upstream = %settings.upstream.base_url,
        "pagecache listening"
    );

    let (signalled_tx, signalled_rx) = oneshot::channel();
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested; draining connections");
            let _ = signalled_tx.send(());
        },
    );

    tokio::select! {
        result = server.into_future() => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        _ = drain_deadline(signalled_rx, settings.server.graceful_shutdown) => {
            warn!(
                seconds = settings.server.graceful_shutdown.as_secs(),
                "graceful shutdown timed out"
            );
        }
    }

    Ok(())
}

async fn drain_deadline(signalled: oneshot::Receiver<()>, grace: Duration) {
    if signalled.await.is_err() {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(grace).await;
}

async fn run_clear_cache(settings: config::Settings) -> Result<(), AppError> {
    let store = build_store(&settings.store);
    let mut sink = |line: &str| println!("{line}");
    let removed = clear_cache(store.as_ref(), &mut sink).await?;
    info!(removed, "clear-cache finished");
    Ok(())
}
