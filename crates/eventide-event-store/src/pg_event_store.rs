//! `PostgreSQL` implementation of the `EventStore` trait.
//!
//! Stream versions live in `event_streams`. An append locks every target
//! stream row (`SELECT ... FOR UPDATE`, in sorted order to avoid deadlocks),
//! checks expectations against the locked versions, inserts the events and
//! bumps the versions in one transaction.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};

use eventide_core::error::EventStoreError;
use eventide_core::event::{EventMetadata, RecordedEvent};
use eventide_core::notify::NotificationHub;
use eventide_core::store::{EventStore, StreamAppend, plan_batch};

const EVENT_COLUMNS: &str = "event_id, stream_id, aggregate_type, event_type, schema_version, \
     sequence_number, occurred_on, payload, metadata";

/// PostgreSQL-backed event store.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
    hub: NotificationHub,
}

impl PgEventStore {
    /// Creates a new `PgEventStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            hub: NotificationHub::default(),
        }
    }

    /// The underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_versions(
        tx: &mut Transaction<'_, Postgres>,
        batch: &[StreamAppend],
    ) -> Result<HashMap<String, u64>, sqlx::Error> {
        let mut stream_ids: Vec<&str> = batch.iter().map(|a| a.stream_id.as_str()).collect();
        stream_ids.sort_unstable();
        stream_ids.dedup();

        let mut versions = HashMap::with_capacity(stream_ids.len());
        for stream_id in stream_ids {
            sqlx::query(
                "INSERT INTO event_streams (stream_id, version) VALUES ($1, 0) \
                 ON CONFLICT (stream_id) DO NOTHING",
            )
            .bind(stream_id)
            .execute(&mut **tx)
            .await?;
            let version: i64 =
                sqlx::query_scalar("SELECT version FROM event_streams WHERE stream_id = $1 FOR UPDATE")
                    .bind(stream_id)
                    .fetch_one(&mut **tx)
                    .await?;
            versions.insert(stream_id.to_owned(), u64::try_from(version).unwrap_or(0));
        }
        Ok(versions)
    }

    async fn fetch(
        &self,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let rows = query.fetch_all(&self.pool).await.map_err(read_error)?;
        rows.iter().map(row_to_event).collect()
    }
}

fn row_to_event(row: &PgRow) -> Result<RecordedEvent, EventStoreError> {
    let schema_version: i32 = row.try_get("schema_version").map_err(read_error)?;
    let sequence_number: i64 = row.try_get("sequence_number").map_err(read_error)?;
    let Json(metadata): Json<EventMetadata> = row.try_get("metadata").map_err(read_error)?;
    Ok(RecordedEvent {
        event_id: row.try_get("event_id").map_err(read_error)?,
        aggregate_id: row.try_get("stream_id").map_err(read_error)?,
        aggregate_type: row.try_get("aggregate_type").map_err(read_error)?,
        event_type: row.try_get("event_type").map_err(read_error)?,
        schema_version: u32::try_from(schema_version)
            .map_err(|e| EventStoreError::Read(format!("invalid schema_version: {e}")))?,
        sequence_number: u64::try_from(sequence_number)
            .map_err(|e| EventStoreError::Read(format!("invalid sequence_number: {e}")))?,
        occurred_on: row.try_get("occurred_on").map_err(read_error)?,
        payload: row.try_get("payload").map_err(read_error)?,
        metadata,
    })
}

fn to_db_int(value: u64) -> Result<i64, EventStoreError> {
    i64::try_from(value).map_err(|e| EventStoreError::Append(format!("version out of range: {e}")))
}

fn read_error(e: sqlx::Error) -> EventStoreError {
    EventStoreError::Read(e.to_string())
}

fn append_error(e: sqlx::Error) -> EventStoreError {
    EventStoreError::Append(e.to_string())
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append_batch(
        &self,
        batch: &[StreamAppend],
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let mut tx = self.pool.begin().await.map_err(append_error)?;
        let versions = Self::lock_versions(&mut tx, batch)
            .await
            .map_err(append_error)?;
        // Dropping `tx` on a conflict rolls back the stream rows created above.
        let planned = plan_batch(batch, |stream_id| versions.get(stream_id).copied().unwrap_or(0))?;

        let mut final_versions: HashMap<&str, u64> = HashMap::new();
        for event in &planned {
            sqlx::query(
                "INSERT INTO domain_events (event_id, stream_id, aggregate_type, event_type, \
                 schema_version, sequence_number, occurred_on, payload, metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(event.event_id)
            .bind(&event.aggregate_id)
            .bind(&event.aggregate_type)
            .bind(&event.event_type)
            .bind(i32::try_from(event.schema_version).unwrap_or(i32::MAX))
            .bind(to_db_int(event.sequence_number)?)
            .bind(event.occurred_on)
            .bind(&event.payload)
            .bind(Json(&event.metadata))
            .execute(&mut *tx)
            .await
            .map_err(append_error)?;
            final_versions.insert(event.aggregate_id.as_str(), event.sequence_number);
        }

        for (stream_id, version) in final_versions {
            sqlx::query("UPDATE event_streams SET version = $2 WHERE stream_id = $1")
                .bind(stream_id)
                .bind(to_db_int(version)?)
                .execute(&mut *tx)
                .await
                .map_err(append_error)?;
        }

        tx.commit().await.map_err(append_error)?;
        tracing::debug!(events = planned.len(), streams = batch.len(), "appended events");
        self.hub.publish(&planned);
        Ok(planned)
    }

    async fn get_events(
        &self,
        stream_id: &str,
        from_version: u64,
        to_version: Option<u64>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events \
             WHERE stream_id = $1 AND sequence_number >= $2 \
             AND ($3::BIGINT IS NULL OR sequence_number <= $3) \
             ORDER BY sequence_number"
        );
        let to_version = to_version.map(|v| i64::try_from(v).unwrap_or(i64::MAX));
        self.fetch(
            sqlx::query(&sql)
                .bind(stream_id)
                .bind(i64::try_from(from_version).unwrap_or(i64::MAX))
                .bind(to_version),
        )
        .await
    }

    async fn stream_version(&self, stream_id: &str) -> Result<u64, EventStoreError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM event_streams WHERE stream_id = $1")
                .bind(stream_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(read_error)?;
        Ok(version.and_then(|v| u64::try_from(v).ok()).unwrap_or(0))
    }

    async fn get_events_by_type(
        &self,
        event_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events \
             WHERE event_type = $1 AND ($2::TIMESTAMPTZ IS NULL OR occurred_on >= $2) \
             ORDER BY global_position"
        );
        self.fetch(sqlx::query(&sql).bind(event_type).bind(since)).await
    }

    async fn get_events_by_aggregate_type(
        &self,
        aggregate_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RecordedEvent>, EventStoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM domain_events \
             WHERE aggregate_type = $1 AND ($2::TIMESTAMPTZ IS NULL OR occurred_on >= $2) \
             ORDER BY global_position"
        );
        self.fetch(sqlx::query(&sql).bind(aggregate_type).bind(since))
            .await
    }

    fn notifications(&self) -> Option<&NotificationHub> {
        Some(&self.hub)
    }
}
