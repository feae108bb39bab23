use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates the registry schema on an open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // `seq` preserves insertion order for listings
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS day_files (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            date_key TEXT NOT NULL UNIQUE,
            file_name TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
