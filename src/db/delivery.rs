//! Delivery rows: one tracked attempt lineage per (subscription, event).

use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};
use tokio_stream::StreamExt;

/// Lifecycle of a delivery.
///
/// `Pending` -> `Success`   (2xx response)
/// `Pending` -> `Failed`    (non-2xx or transport failure)
///
/// A failed delivery with attempts remaining carries a `next_retry_at` and is
/// re-enqueued by the scheduler; a failed delivery with attempts exhausted is
/// terminal until an operator calls retry.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, strum::Display)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Serialize, Deserialize, FromRow, Debug)]
pub struct Delivery {
    pub id: i64,
    pub webhook_id: i64,
    pub org_id: String,
    pub audit_log_id: Option<String>,
    /// `"{table}.{operation}"`
    pub event_type: String,
    pub status: DeliveryStatus,
    pub request_payload: String,
    pub response_status: Option<i64>,
    pub response_body: Option<String>,
    pub response_headers: Option<String>,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub next_retry_at: Option<i64>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
}

/// Outcome fields recorded after one outbound attempt.
#[derive(Debug)]
pub struct AttemptRecord {
    pub response_status: Option<i64>,
    pub response_body: Option<String>,
    pub response_headers: Option<String>,
    pub duration_ms: i64,
}

impl Delivery {
    pub async fn insert_pending(
        db: &mut SqliteConnection,
        webhook_id: i64,
        org_id: impl AsRef<str>,
        audit_log_id: Option<&str>,
        event_type: impl AsRef<str>,
        request_payload: impl AsRef<str>,
        max_attempts: u32,
    ) -> eyre::Result<Delivery> {
        Ok(sqlx::query_as(
            "INSERT INTO deliveries
                 (webhook_id, org_id, audit_log_id, event_type, status, request_payload, max_attempts)
             VALUES ($1, $2, $3, $4, 'pending', $5, $6)
             RETURNING *",
        )
        .bind(webhook_id)
        .bind(org_id.as_ref())
        .bind(audit_log_id)
        .bind(event_type.as_ref())
        .bind(request_payload.as_ref())
        .bind(max_attempts)
        .fetch_one(db)
        .await?)
    }

    pub async fn get(db: &mut SqliteConnection, id: i64) -> eyre::Result<Option<Delivery>> {
        Ok(sqlx::query_as("SELECT * FROM deliveries WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await?)
    }

    pub async fn get_scoped(
        db: &mut SqliteConnection,
        org_id: impl AsRef<str>,
        id: i64,
    ) -> eyre::Result<Option<Delivery>> {
        Ok(
            sqlx::query_as("SELECT * FROM deliveries WHERE org_id = $1 AND id = $2")
                .bind(org_id.as_ref())
                .bind(id)
                .fetch_optional(db)
                .await?,
        )
    }

    /// Claim the delivery for one attempt. Returns `None` when the delivery
    /// is already successful or out of attempts, which makes redelivered
    /// queue messages a no-op.
    pub async fn begin_attempt(
        db: &mut SqliteConnection,
        id: i64,
    ) -> eyre::Result<Option<Delivery>> {
        Ok(sqlx::query_as(
            "UPDATE deliveries
             SET attempt_count = attempt_count + 1, next_retry_at = NULL
             WHERE id = $1 AND status != 'success' AND attempt_count < max_attempts
             RETURNING *",
        )
        .bind(id)
        .fetch_optional(db)
        .await?)
    }

    pub async fn record_success(
        db: &mut SqliteConnection,
        id: i64,
        attempt: &AttemptRecord,
    ) -> eyre::Result<()> {
        sqlx::query(
            "UPDATE deliveries
             SET status = 'success',
                 response_status = $1, response_body = $2, response_headers = $3,
                 duration_ms = $4, completed_at = unixepoch(), next_retry_at = NULL
             WHERE id = $5",
        )
        .bind(attempt.response_status)
        .bind(&attempt.response_body)
        .bind(&attempt.response_headers)
        .bind(attempt.duration_ms)
        .bind(id)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Record a failed attempt. `next_retry_at` must be `Some` only when
    /// attempts remain.
    pub async fn record_failure(
        db: &mut SqliteConnection,
        id: i64,
        attempt: &AttemptRecord,
        next_retry_at: Option<i64>,
    ) -> eyre::Result<()> {
        sqlx::query(
            "UPDATE deliveries
             SET status = 'failed',
                 response_status = $1, response_body = $2, response_headers = $3,
                 duration_ms = $4, completed_at = unixepoch(), next_retry_at = $5
             WHERE id = $6",
        )
        .bind(attempt.response_status)
        .bind(&attempt.response_body)
        .bind(&attempt.response_headers)
        .bind(attempt.duration_ms)
        .bind(next_retry_at)
        .bind(id)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Operator retry: reset the row to a fresh pending lineage, keeping the
    /// same delivery identity. Returns `None` when the delivery does not
    /// belong to the org.
    pub async fn reset_for_retry(
        db: &mut SqliteConnection,
        org_id: impl AsRef<str>,
        id: i64,
    ) -> eyre::Result<Option<Delivery>> {
        Ok(sqlx::query_as(
            "UPDATE deliveries
             SET status = 'pending', attempt_count = 0, next_retry_at = NULL,
                 response_status = NULL, response_body = NULL, response_headers = NULL,
                 completed_at = NULL, duration_ms = NULL
             WHERE org_id = $1 AND id = $2
             RETURNING *",
        )
        .bind(org_id.as_ref())
        .bind(id)
        .fetch_optional(db)
        .await?)
    }

    /// Claim every failed delivery whose retry time has come, clearing
    /// `next_retry_at` so a concurrent scheduler tick cannot double-enqueue.
    pub async fn claim_due(db: &mut SqliteConnection, now: i64) -> eyre::Result<Vec<i64>> {
        let mut stream = sqlx::query_scalar(
            "UPDATE deliveries
             SET next_retry_at = NULL
             WHERE status = 'failed' AND attempt_count < max_attempts
               AND next_retry_at IS NOT NULL AND next_retry_at <= $1
             RETURNING id",
        )
        .bind(now)
        .fetch(db);

        let mut ids = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            ids.push(res);
        }

        Ok(ids)
    }

    pub async fn list_page(
        db: &mut SqliteConnection,
        org_id: impl AsRef<str>,
        webhook_id: Option<i64>,
        status: Option<DeliveryStatus>,
        page: u32,
        per_page: u32,
    ) -> eyre::Result<(Vec<Delivery>, i64)> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deliveries
             WHERE org_id = $1
               AND ($2 IS NULL OR webhook_id = $2)
               AND ($3 IS NULL OR status = $3)",
        )
        .bind(org_id.as_ref())
        .bind(webhook_id)
        .bind(status)
        .fetch_one(&mut *db)
        .await?;

        let offset = i64::from(page.saturating_sub(1)) * i64::from(per_page);

        let mut stream = sqlx::query_as(
            "SELECT * FROM deliveries
             WHERE org_id = $1
               AND ($2 IS NULL OR webhook_id = $2)
               AND ($3 IS NULL OR status = $3)
             ORDER BY id DESC
             LIMIT $4 OFFSET $5",
        )
        .bind(org_id.as_ref())
        .bind(webhook_id)
        .bind(status)
        .bind(per_page)
        .bind(offset)
        .fetch(db);

        let mut deliveries = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            deliveries.push(res);
        }

        Ok((deliveries, total))
    }
}
