//! Webhook subscription rows and the event vocabulary they may subscribe to.

use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::Json, SqliteConnection};
use tokio_stream::StreamExt;
use url::Url;

use crate::error::Error;

/// Tables a subscription can listen on. `events` entries are either a bare
/// table name or a `table.operation` pattern.
pub const EVENT_TABLES: &[&str] = &["apps", "app_versions", "channels", "org_users", "orgs"];

pub const EVENT_OPERATIONS: &[&str] = &["insert", "update", "delete"];

/// An org-scoped subscription rule. Read-only from the pipeline's
/// perspective; mutated only through the dashboard surface.
#[derive(Serialize, Deserialize, FromRow, Debug)]
pub struct Webhook {
    pub id: i64,
    pub org_id: String,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub enabled: bool,
    pub events: Json<Vec<String>>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields accepted on create and update.
#[derive(Serialize, Deserialize, Debug)]
pub struct WebhookParams {
    pub name: String,
    pub url: String,
    pub secret: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub events: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl WebhookParams {
    /// Reject urls that are not HTTPS (loopback hosts may use plain HTTP for
    /// local testing) and events outside the known vocabulary.
    pub fn validate(&self) -> Result<(), Error> {
        let url = Url::parse(&self.url)
            .map_err(|e| Error::invalid_parameter(format!("url: {e}")))?;

        let loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
        if url.scheme() != "https" && !(url.scheme() == "http" && loopback) {
            return Err(Error::invalid_parameter(
                "url must be https (http is allowed for loopback only)",
            ));
        }

        if self.events.is_empty() {
            return Err(Error::missing_parameter("events"));
        }

        for event in &self.events {
            if !is_known_event(event) {
                return Err(Error::invalid_parameter(format!("unknown event {event:?}")));
            }
        }

        Ok(())
    }
}

/// Whether `event` is a known table name or `table.operation` pattern.
pub fn is_known_event(event: &str) -> bool {
    match event.split_once('.') {
        None => EVENT_TABLES.contains(&event),
        Some((table, op)) => EVENT_TABLES.contains(&table) && EVENT_OPERATIONS.contains(&op),
    }
}

impl Webhook {
    pub async fn insert(
        db: &mut SqliteConnection,
        org_id: impl AsRef<str>,
        params: &WebhookParams,
    ) -> eyre::Result<Webhook> {
        Ok(sqlx::query_as(
            "INSERT INTO webhooks (org_id, name, url, secret, enabled, events)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING *",
        )
        .bind(org_id.as_ref())
        .bind(&params.name)
        .bind(&params.url)
        .bind(&params.secret)
        .bind(params.enabled)
        .bind(Json(&params.events))
        .fetch_one(db)
        .await?)
    }

    pub async fn update(
        db: &mut SqliteConnection,
        org_id: impl AsRef<str>,
        id: i64,
        params: &WebhookParams,
    ) -> eyre::Result<Option<Webhook>> {
        Ok(sqlx::query_as(
            "UPDATE webhooks
             SET name = $1, url = $2, secret = $3, enabled = $4, events = $5,
                 updated_at = unixepoch()
             WHERE org_id = $6 AND id = $7
             RETURNING *",
        )
        .bind(&params.name)
        .bind(&params.url)
        .bind(&params.secret)
        .bind(params.enabled)
        .bind(Json(&params.events))
        .bind(org_id.as_ref())
        .bind(id)
        .fetch_optional(db)
        .await?)
    }

    pub async fn delete(
        db: &mut SqliteConnection,
        org_id: impl AsRef<str>,
        id: i64,
    ) -> eyre::Result<bool> {
        let res = sqlx::query("DELETE FROM webhooks WHERE org_id = $1 AND id = $2")
            .bind(org_id.as_ref())
            .bind(id)
            .execute(db)
            .await?;

        Ok(res.rows_affected() > 0)
    }

    /// Flip `enabled`, returning the new state.
    pub async fn toggle(
        db: &mut SqliteConnection,
        org_id: impl AsRef<str>,
        id: i64,
    ) -> eyre::Result<Option<bool>> {
        Ok(sqlx::query_scalar(
            "UPDATE webhooks
             SET enabled = NOT enabled, updated_at = unixepoch()
             WHERE org_id = $1 AND id = $2
             RETURNING enabled",
        )
        .bind(org_id.as_ref())
        .bind(id)
        .fetch_optional(db)
        .await?)
    }

    pub async fn get(
        db: &mut SqliteConnection,
        org_id: impl AsRef<str>,
        id: i64,
    ) -> eyre::Result<Option<Webhook>> {
        Ok(
            sqlx::query_as("SELECT * FROM webhooks WHERE org_id = $1 AND id = $2")
                .bind(org_id.as_ref())
                .bind(id)
                .fetch_optional(db)
                .await?,
        )
    }

    pub async fn list(
        db: &mut SqliteConnection,
        org_id: impl AsRef<str>,
    ) -> eyre::Result<Vec<Webhook>> {
        let mut stream = sqlx::query_as("SELECT * FROM webhooks WHERE org_id = $1 ORDER BY id")
            .bind(org_id.as_ref())
            .fetch(db);

        let mut webhooks = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            webhooks.push(res);
        }

        Ok(webhooks)
    }

    /// Enabled subscriptions for an org whose event filter covers the given
    /// table and operation.
    pub async fn list_enabled_for_event(
        db: &mut SqliteConnection,
        org_id: impl AsRef<str>,
        table_name: impl AsRef<str>,
        operation: impl AsRef<str>,
    ) -> eyre::Result<Vec<Webhook>> {
        let pattern = format!("{}.{}", table_name.as_ref(), operation.as_ref());

        let mut stream = sqlx::query_as(
            "SELECT * FROM webhooks
             WHERE org_id = $1 AND enabled = 1
             AND EXISTS (
                 SELECT 1 FROM json_each(webhooks.events)
                 WHERE json_each.value IN ($2, $3)
             )
             ORDER BY id",
        )
        .bind(org_id.as_ref())
        .bind(table_name.as_ref())
        .bind(&pattern)
        .fetch(db);

        let mut webhooks = Vec::new();

        while let Some(res) = stream.next().await.transpose()? {
            webhooks.push(res);
        }

        Ok(webhooks)
    }
}
