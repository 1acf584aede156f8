//! db-transactor - Main entry point.
//!
//! Serves the users resource over HTTP on top of a transactional data-access
//! layer backed by PostgreSQL or SQLite.

use clap::Parser;
use db_transactor::config::{Config, redact_url};
use db_transactor::db::{Backend, BackendKind, ConnContainer, Session, Transactor};
use db_transactor::error::DbResult;
use db_transactor::http::{AppState, HttpServer, router};
use db_transactor::users::User;
use sqlx::{FromRow, Postgres, Sqlite};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

async fn run<DB: Backend>(config: &Config) -> DbResult<()>
where
    User: for<'r> FromRow<'r, DB::Row>,
{
    let pool_config = config.pool_config();
    let settings = pool_config.resolve();
    info!(
        backend = %DB::KIND,
        primary = %redact_url(&config.database_url),
        replica = %config.replica_url.as_deref().map(redact_url).unwrap_or_else(|| "primary".to_string()),
        max_open_conns = settings.max_open_conns,
        max_idle_conns = settings.max_idle_conns,
        "Connecting to database"
    );

    let conns = ConnContainer::<DB>::connect(
        &config.database_url,
        config.replica_url.as_deref(),
        &pool_config,
    )
    .await?;
    conns.ping().await?;

    let transactor = Transactor::new(conns.primary_pool().clone(), config.transactor_config());
    let state = AppState::new(conns.clone(), transactor);
    state.users.init_schema(&Session::new()).await?;

    let server = HttpServer::new(&config.http_host, config.http_port);
    let result = server.run(router(state)).await;

    info!("Closing database connections");
    conns.close().await;
    result
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!(
        isolation = %config.isolation_level,
        read_only = config.read_only,
        "Starting db-transactor v{}",
        env!("CARGO_PKG_VERSION")
    );

    let result = match BackendKind::from_url(&config.database_url)? {
        BackendKind::Postgres => run::<Postgres>(&config).await,
        BackendKind::Sqlite => run::<Sqlite>(&config).await,
    };

    if let Err(e) = result {
        error!(error = %e, suggestion = ?e.suggestion(), "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
