//! Resumely API Server
//!
//! Receives billing provider webhooks and serves the internal subscriber
//! routes the application backend calls.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use resumely_api::{create_router, AppState, Config};
use resumely_billing::BillingService;
use resumely_shared::{create_migration_pool, create_pool, run_migrations};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!("Starting Resumely API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    // Create database pool (using pooler URL for regular queries)
    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url)
        .await
        .context("failed to connect to database")?;
    tracing::info!("Database connection established");

    // Run migrations using direct URL (bypasses PgBouncer which doesn't support prepared statements)
    if config.run_migrations {
        tracing::info!("Running database migrations...");
        let migration_pool = create_migration_pool(config.migration_url()).await?;
        run_migrations(&migration_pool).await?;
        migration_pool.close().await;
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS not set)");
    }

    // Billing refuses to start without a webhook secret unless explicitly
    // running unverified outside production
    let billing = BillingService::from_env(pool.clone())
        .context("billing configuration invalid")?;
    tracing::info!("Billing reconciler initialized");

    let state = AppState::new(
        Arc::new(billing),
        Some(pool),
        config.internal_api_token.clone(),
    );

    let app = create_router(state).layer(TraceLayer::new_for_http());

    // Parse bind address
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    // Start the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,resumely_api=debug,resumely_billing=debug".into());

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
