//! `PostgreSQL` implementation of the `SnapshotStore` trait.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use eventide_core::error::SnapshotError;
use eventide_core::snapshot::{Snapshot, SnapshotStore, usable_snapshot};

/// PostgreSQL-backed snapshot store. State is stored as canonical JSON
/// text so the checksum can be verified byte for byte.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    /// Creates a new `PgSnapshotStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage_error(e: sqlx::Error) -> SnapshotError {
    SnapshotError::Storage(e.to_string())
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let data = serde_json::to_string(&snapshot.data)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        let version = i64::try_from(snapshot.version)
            .map_err(|e| SnapshotError::Storage(format!("version out of range: {e}")))?;
        sqlx::query(
            "INSERT INTO snapshots (aggregate_id, aggregate_type, version, created_at, data, checksum) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (aggregate_id) DO UPDATE SET \
                aggregate_type = EXCLUDED.aggregate_type, \
                version = EXCLUDED.version, \
                created_at = EXCLUDED.created_at, \
                data = EXCLUDED.data, \
                checksum = EXCLUDED.checksum \
             WHERE snapshots.version <= EXCLUDED.version",
        )
        .bind(&snapshot.aggregate_id)
        .bind(&snapshot.aggregate_type)
        .bind(version)
        .bind(snapshot.created_at)
        .bind(data)
        .bind(&snapshot.checksum)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        tracing::debug!(
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version,
            "saved snapshot"
        );
        Ok(())
    }

    async fn get_snapshot(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
    ) -> Result<Option<Snapshot>, SnapshotError> {
        let row = sqlx::query(
            "SELECT aggregate_id, aggregate_type, version, created_at, data, checksum \
             FROM snapshots WHERE aggregate_id = $1",
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let data: String = row.try_get("data").map_err(storage_error)?;
        let version: i64 = row.try_get("version").map_err(storage_error)?;
        let Ok(data) = serde_json::from_str(&data) else {
            tracing::warn!(aggregate_id, "ignoring snapshot with unreadable data");
            return Ok(None);
        };
        let snapshot = Snapshot {
            aggregate_id: row.try_get("aggregate_id").map_err(storage_error)?,
            aggregate_type: row.try_get("aggregate_type").map_err(storage_error)?,
            version: u64::try_from(version).unwrap_or(0),
            created_at: row.try_get("created_at").map_err(storage_error)?,
            data,
            checksum: row.try_get("checksum").map_err(storage_error)?,
        };
        Ok(usable_snapshot(Some(snapshot), aggregate_type))
    }

    async fn delete_snapshot(&self, aggregate_id: &str) -> Result<(), SnapshotError> {
        sqlx::query("DELETE FROM snapshots WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}
