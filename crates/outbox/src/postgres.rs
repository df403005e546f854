use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};

use crate::{
    EventType, OutboxError, OutboxEvent, OutboxStatus, Result,
    store::{Append, OutboxStore},
};

/// PostgreSQL-backed outbox store.
///
/// The `outbox_events` table carries a unique index on
/// `(aggregate_id, event_type)`; the insert relies on `ON CONFLICT DO
/// NOTHING` so concurrent appends of the same key cannot create duplicates.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Creates a new PostgreSQL outbox store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    /// Appends over a caller-supplied connection.
    ///
    /// Pass the connection of an open transaction to commit the business
    /// mutation and the event record together — the core correctness
    /// property of the outbox pattern.
    pub async fn append_with(
        conn: &mut PgConnection,
        aggregate_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<Append> {
        let inserted: Option<PgRow> = sqlx::query(
            r#"
            INSERT INTO outbox_events (aggregate_id, event_type, payload, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'INIT', NOW(), NOW())
            ON CONFLICT (aggregate_id, event_type) DO NOTHING
            RETURNING aggregate_id, event_type, payload, status, created_at, updated_at
            "#,
        )
        .bind(aggregate_id)
        .bind(event_type.topic())
        .bind(&payload)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(row) = inserted {
            return Ok(Append::Recorded(Self::row_to_event(row)?));
        }

        let existing: PgRow = sqlx::query(
            r#"
            SELECT aggregate_id, event_type, payload, status, created_at, updated_at
            FROM outbox_events
            WHERE aggregate_id = $1 AND event_type = $2
            "#,
        )
        .bind(aggregate_id)
        .bind(event_type.topic())
        .fetch_one(&mut *conn)
        .await?;

        let event = Self::row_to_event(existing)?;
        if event.status == OutboxStatus::Init {
            Ok(Append::Recorded(event))
        } else {
            Ok(Append::AlreadyResolved(event))
        }
    }

    fn row_to_event(row: PgRow) -> Result<OutboxEvent> {
        let event_type_raw: String = row.try_get("event_type")?;
        let status_raw: String = row.try_get("status")?;

        let event_type = EventType::from_topic(&event_type_raw)
            .ok_or_else(|| sqlx::Error::Decode(format!("unknown event type: {event_type_raw}").into()))?;
        let status = OutboxStatus::from_str_opt(&status_raw)
            .ok_or_else(|| sqlx::Error::Decode(format!("unknown status: {status_raw}").into()))?;

        Ok(OutboxEvent {
            aggregate_id: row.try_get("aggregate_id")?,
            event_type,
            payload: row.try_get("payload")?,
            status,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn append(
        &self,
        aggregate_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<Append> {
        let mut conn = self.pool.acquire().await?;
        Self::append_with(&mut conn, aggregate_id, event_type, payload).await
    }

    async fn update_status(
        &self,
        aggregate_id: &str,
        event_type: EventType,
        status: OutboxStatus,
    ) -> Result<()> {
        let current = self
            .find(aggregate_id, event_type)
            .await?
            .ok_or_else(|| OutboxError::EventNotFound {
                aggregate_id: aggregate_id.to_string(),
                event_type,
            })?;

        if current.status == status {
            return Ok(());
        }
        if !current.status.can_transition_to(status) {
            return Err(OutboxError::InvalidTransition {
                aggregate_id: aggregate_id.to_string(),
                event_type,
                from: current.status,
                to: status,
            });
        }

        // Guard on the observed status so a concurrent updater cannot
        // sneak an invalid transition past the check above.
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = $3, updated_at = NOW()
            WHERE aggregate_id = $1 AND event_type = $2 AND status = $4
            "#,
        )
        .bind(aggregate_id)
        .bind(event_type.topic())
        .bind(status.as_str())
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(
        &self,
        aggregate_id: &str,
        event_type: EventType,
    ) -> Result<Option<OutboxEvent>> {
        let row = sqlx::query(
            r#"
            SELECT aggregate_id, event_type, payload, status, created_at, updated_at
            FROM outbox_events
            WHERE aggregate_id = $1 AND event_type = $2
            "#,
        )
        .bind(aggregate_id)
        .bind(event_type.topic())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_event).transpose()
    }

    async fn list_by_status(&self, status: OutboxStatus) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT aggregate_id, event_type, payload, status, created_at, updated_at
            FROM outbox_events
            WHERE status = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn list_for_aggregate(&self, aggregate_id: &str) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT aggregate_id, event_type, payload, status, created_at, updated_at
            FROM outbox_events
            WHERE aggregate_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }
}
