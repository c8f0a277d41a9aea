use sqlx::postgres::PgPoolOptions;
use textproc_core::config::AppConfig;

pub async fn run(cfg: &AppConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&cfg.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!(event = "migrate.done", "database migrations applied");
    Ok(())
}
