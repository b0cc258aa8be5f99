//! Event store database schema.
//!
//! The DDL lives in the workspace `migrations/` directory and is embedded
//! at compile time.

use sqlx::PgPool;
use sqlx::migrate::MigrateError;

/// Applies all pending migrations.
///
/// # Errors
///
/// Returns the migrator's error if a migration fails or the applied
/// history diverges from the embedded one.
pub async fn migrate(pool: &PgPool) -> Result<(), MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("event store schema is up to date");
    Ok(())
}
