use std::{process, sync::Arc, time::Duration};

use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use verdant::{
    application::{admin::AdminService, error::AppError},
    cache::{CacheConfig, CacheState},
    config,
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
};

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
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Republish(_) => run_republish(settings).await,
        config::Command::RepublishSubtree(args) => run_republish_subtree(settings, args.id).await,
    }
}

async fn init_cache(settings: &config::Settings) -> Result<Arc<CacheState>, AppError> {
    let url = settings
        .database
        .url
        .as_deref()
        .ok_or_else(|| InfraError::configuration("database.url must be set"))?;

    let pool = PostgresRepositories::connect(url, settings.database.max_connections.get())
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;
    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| InfraError::database(format!("migrations failed: {err}")))?;

    let source = Arc::new(PostgresRepositories::new(pool));
    Ok(Arc::new(CacheState::new(
        CacheConfig::from(&settings.cache),
        source,
    )))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache = init_cache(&settings).await?;

    let warmed = cache.snapshot().await;
    info!(
        nodes = warmed.len(),
        populated = cache.is_populated(),
        "Tree cache warmed"
    );
    drop(warmed);

    // Covers changes made outside any request, e.g. by hooks or background callers.
    let flush_handle = cache
        .persistence()
        .spawn_interval(cache.config().flush_interval);

    let router = http::build_router(HttpState::new(cache.clone()));
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| InfraError::bind(settings.server.addr, err))?;
    info!(addr = %settings.server.addr, "Listening");

    let result = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")));

    flush_handle.abort();
    let _ = flush_handle.await;
    flush_on_exit(&cache, settings.server.graceful_shutdown).await;

    result
}

async fn run_republish(settings: config::Settings) -> Result<(), AppError> {
    let cache = init_cache(&settings).await?;
    let summary = AdminService::new(cache.clone()).republish_all().await?;
    info!(
        nodes = summary.nodes,
        orphans = summary.orphans,
        invalid = summary.invalid,
        vetoed = summary.vetoed,
        "Republish complete"
    );
    flush_on_exit(&cache, settings.server.graceful_shutdown).await;
    Ok(())
}

async fn run_republish_subtree(settings: config::Settings, id: i64) -> Result<(), AppError> {
    let cache = init_cache(&settings).await?;
    let summary = AdminService::new(cache.clone())
        .republish_subtree(id)
        .await?;
    info!(
        node_id = id,
        published = summary.published.len(),
        skipped = summary.skipped.len(),
        rebuilt = summary.rebuilt,
        "Subtree republish complete"
    );
    flush_on_exit(&cache, settings.server.graceful_shutdown).await;
    Ok(())
}

async fn flush_on_exit(cache: &CacheState, deadline: Duration) {
    match tokio::time::timeout(deadline, cache.flush()).await {
        Ok(Ok(true)) => info!("Snapshot file flushed"),
        Ok(Ok(false)) => {}
        Ok(Err(err)) => warn!(error = %err, "Final snapshot flush failed"),
        Err(_) => warn!(
            deadline_secs = deadline.as_secs(),
            "Final snapshot flush timed out"
        ),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
