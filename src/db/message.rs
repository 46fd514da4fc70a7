//! Durable queue primitives.
//!
//! A single `messages` table holds every named queue. Claiming a batch bumps
//! `read_ct` and pushes `visible_at` forward, so a message is visible to at
//! most one consumer until its visibility timeout elapses. Messages are only
//! ever removed by an explicit `delete` (success) or `archive` (dead-letter);
//! anything else becomes redeliverable once the window expires.

use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, SqliteConnection};
use tokio_stream::StreamExt;

/// One claimed work item, as returned by [`Message::read`].
#[derive(Serialize, Deserialize, FromRow, Debug)]
pub struct Message {
    pub id: i64,
    /// Times this message has been claimed, including the current claim.
    pub read_ct: i64,
    pub body: String,
}

impl Message {
    /// Enqueue a message body on a named queue, returning the assigned id.
    pub async fn send(
        db: &mut SqliteConnection,
        queue: impl AsRef<str>,
        body: impl AsRef<str>,
    ) -> eyre::Result<i64> {
        Ok(
            sqlx::query_scalar("INSERT INTO messages (queue, body) VALUES ($1, $2) RETURNING id")
                .bind(queue.as_ref())
                .bind(body.as_ref())
                .fetch_one(db)
                .await?,
        )
    }

    /// Atomically claim up to `batch_size` visible messages: increment their
    /// read counts and hide them for `visibility_timeout_secs`.
    pub async fn read(
        db: &mut SqliteConnection,
        queue: impl AsRef<str>,
        visibility_timeout_secs: u32,
        batch_size: u32,
    ) -> eyre::Result<Vec<Message>> {
        let mut stream = sqlx::query_as(
            "UPDATE messages
             SET read_ct = read_ct + 1,
                 visible_at = unixepoch() + $1
             WHERE id IN (
                 SELECT id FROM messages
                 WHERE queue = $2 AND visible_at <= unixepoch()
                 ORDER BY id
                 LIMIT $3
             )
             RETURNING id, read_ct, body",
        )
        .bind(visibility_timeout_secs)
        .bind(queue.as_ref())
        .bind(batch_size)
        .fetch(db);

        let mut messages = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            messages.push(res);
        }

        Ok(messages)
    }

    /// Remove acknowledged messages. Ids already absent are skipped, so
    /// concurrent consumers acting on overlapping id sets converge safely.
    pub async fn delete(
        db: &mut SqliteConnection,
        queue: impl AsRef<str>,
        ids: &[i64],
    ) -> eyre::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let res = sqlx::query(
            "DELETE FROM messages
             WHERE queue = $1 AND id IN (SELECT value FROM json_each($2))",
        )
        .bind(queue.as_ref())
        .bind(serde_json::to_string(ids)?)
        .execute(db)
        .await?;

        Ok(res.rows_affected())
    }

    /// Move exhausted messages into `archived_messages` for manual
    /// inspection. Archiving an id that is already archived or absent is a
    /// no-op.
    pub async fn archive(
        db: &mut SqliteConnection,
        queue: impl AsRef<str>,
        ids: &[i64],
    ) -> eyre::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let id_set = serde_json::to_string(ids)?;

        sqlx::query(
            "INSERT OR IGNORE INTO archived_messages (id, queue, read_ct, enqueued_at, body)
             SELECT id, queue, read_ct, enqueued_at, body FROM messages
             WHERE queue = $1 AND id IN (SELECT value FROM json_each($2))",
        )
        .bind(queue.as_ref())
        .bind(&id_set)
        .execute(&mut *db)
        .await?;

        let res = sqlx::query(
            "DELETE FROM messages
             WHERE queue = $1 AND id IN (SELECT value FROM json_each($2))",
        )
        .bind(queue.as_ref())
        .bind(&id_set)
        .execute(db)
        .await?;

        Ok(res.rows_affected())
    }

    /// Number of archived messages on a queue.
    pub async fn archived_count(
        db: &mut SqliteConnection,
        queue: impl AsRef<str>,
    ) -> eyre::Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM archived_messages WHERE queue = $1")
                .bind(queue.as_ref())
                .fetch_one(db)
                .await?,
        )
    }
}
