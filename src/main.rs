use std::sync::Arc;
use std::time::Duration;

use dedup_engine::config::Settings;
use dedup_engine::coordinator::CleanupJob;
use dedup_engine::observability::{init_logging, init_metrics, HealthChecker, LogConfig, LogFormat};
use dedup_engine::store::PostgresRecordStore;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;

    // Initialize logging
    init_logging(&LogConfig {
        level: settings.application.log_level.clone(),
        format: LogFormat::from(settings.application.log_format.as_str()),
        ..LogConfig::default()
    });
    info!("Configuration loaded");

    // Initialize metrics
    let _metrics_handle = init_metrics();

    // Connect to PostgreSQL
    info!("Connecting to database at {}...", settings.database.url);
    let pool = PgPoolOptions::new()
        .max_connections(settings.database.pool_size)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&settings.database.url)
        .await?;

    info!("Database connection established");

    // Run migrations
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations applied successfully");

    // Connect to Redis
    info!("Connecting to Redis at {}...", settings.redis.url);
    let redis_client = redis::Client::open(settings.redis.url.clone())?;
    let mut con = redis_client.get_multiplexed_async_connection().await?;
    let _: () = redis::cmd("PING").query_async(&mut con).await?;
    info!("Redis connection established");

    let health = HealthChecker::new(Some(pool.clone()), Some(redis_client))
        .check_all()
        .await;
    info!("Startup verification complete: {:?}", health.status);

    let options = settings.dedup.to_options();
    let store = Arc::new(PostgresRecordStore::new(pool));

    // Run the background sweeper until shutdown.
    let interval = options
        .cleanup_interval
        .unwrap_or(Duration::from_secs(3600));
    let sweeper = CleanupJob::new(store, interval).start();
    info!("Expired-record sweeper running every {:?}", interval);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    sweeper.abort();

    Ok(())
}
