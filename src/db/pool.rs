use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

#[tracing::instrument(name = "db.pool.create", skip(database_url))]
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;

    tracing::info!(max_connections = 10, "Report store pool created");

    Ok(pool)
}
