//! Delivery tracker: executes individual webhook deliveries, records their
//! outcomes, and schedules retries with exponential backoff.

use std::time::Instant;

use reqwest::header::CONTENT_TYPE;

use crate::{
    consumer::WorkItem,
    db::{
        delivery::{AttemptRecord, Delivery},
        message::Message,
        webhook::Webhook,
    },
    error::Error,
    fanout::{DELIVERY_QUEUE, FN_DELIVER_WEBHOOK},
    service::Service,
    signing,
};

/// Stored response bodies are truncated to this preview length.
pub const RESPONSE_PREVIEW_LEN: usize = 2048;

/// Trigger function name for the retry scheduler tick.
pub const FN_ENQUEUE_DUE_RETRIES: &str = "enqueue_due_retries";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// Already successful or out of attempts; redelivered messages land here.
    Skipped,
    Succeeded,
    /// Failed with attempts remaining; `next_retry_at` was scheduled.
    Scheduled,
    /// Failed with attempts exhausted; terminal until an operator retries.
    Exhausted,
}

/// Exponential backoff delay for the attempt that just failed.
/// `base * 2^(attempt-1)`, capped at `max`, plus up to `jitter` seconds.
pub fn retry_delay_secs(attempt: i64, base: i64, max: i64, jitter: i64) -> i64 {
    let base = base.max(1);
    let shift = attempt.saturating_sub(1).clamp(0, 32) as u32;
    let delay = base.saturating_mul(1i64 << shift).min(max.max(base));

    if jitter > 0 {
        delay + rand::Rng::gen_range(&mut rand::thread_rng(), 0..=jitter)
    } else {
        delay
    }
}

fn preview(body: String) -> String {
    if body.len() > RESPONSE_PREVIEW_LEN {
        let mut end = RESPONSE_PREVIEW_LEN;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body[..end].to_owned()
    } else {
        body
    }
}

/// Execute one delivery attempt end to end.
pub async fn execute(service: &Service, delivery_id: i64) -> eyre::Result<ExecuteOutcome> {
    let Some(delivery) = ({
        let mut conn = service.db().acquire().await?;
        Delivery::begin_attempt(&mut conn, delivery_id).await?
    }) else {
        tracing::debug!(delivery_id, "delivery already settled, skipping");
        return Ok(ExecuteOutcome::Skipped);
    };

    let webhook = {
        let mut conn = service.db().acquire().await?;
        Webhook::get(&mut conn, &delivery.org_id, delivery.webhook_id).await?
    };

    let Some(webhook) = webhook else {
        // Subscription deleted since the fan-out; nothing left to call.
        tracing::warn!(delivery_id, webhook_id = delivery.webhook_id, "subscription gone");
        let attempt = AttemptRecord {
            response_status: None,
            response_body: Some("webhook subscription no longer exists".to_owned()),
            response_headers: None,
            duration_ms: 0,
        };
        let mut conn = service.db().acquire().await?;
        Delivery::record_failure(&mut conn, delivery_id, &attempt, None).await?;
        return Ok(ExecuteOutcome::Exhausted);
    };

    let timestamp = chrono::Utc::now().timestamp();
    let signature = signing::compute_signature(
        webhook.secret.as_bytes(),
        delivery.request_payload.as_bytes(),
        timestamp,
    );

    let started = Instant::now();
    let response = service
        .http()
        .post(webhook.url.clone())
        .header(CONTENT_TYPE, "application/json")
        .header(signing::SIGNATURE_HEADER, signature)
        .header(signing::TIMESTAMP_HEADER, timestamp.to_string())
        .body(delivery.request_payload.clone())
        .timeout(std::time::Duration::from_secs(
            service.config().delivery_timeout_secs(),
        ))
        .send()
        .await;
    let duration_ms = started.elapsed().as_millis() as i64;

    let (attempt, success) = match response {
        Ok(res) => {
            let status = res.status();
            let headers = serde_json::Value::Object(
                res.headers()
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.to_string(),
                            serde_json::Value::String(
                                String::from_utf8_lossy(value.as_bytes()).into_owned(),
                            ),
                        )
                    })
                    .collect(),
            );
            let body = res.text().await.unwrap_or_default();

            (
                AttemptRecord {
                    response_status: Some(i64::from(status.as_u16())),
                    response_body: Some(preview(body)),
                    response_headers: Some(headers.to_string()),
                    duration_ms,
                },
                status.is_success(),
            )
        }
        Err(err) => (
            AttemptRecord {
                response_status: None,
                response_body: Some(preview(err.to_string())),
                response_headers: None,
                duration_ms,
            },
            false,
        ),
    };

    let mut conn = service.db().acquire().await?;

    if success {
        Delivery::record_success(&mut conn, delivery_id, &attempt).await?;
        tracing::info!(delivery_id, webhook_id = webhook.id, duration_ms, "delivery succeeded");
        return Ok(ExecuteOutcome::Succeeded);
    }

    // begin_attempt already bumped attempt_count for this attempt.
    let attempts_remaining = delivery.attempt_count < delivery.max_attempts;

    let next_retry_at = attempts_remaining.then(|| {
        let config = service.config();
        chrono::Utc::now().timestamp()
            + retry_delay_secs(
                delivery.attempt_count,
                config.retry_base_secs(),
                config.retry_max_secs(),
                config.retry_jitter_secs(),
            )
    });

    Delivery::record_failure(&mut conn, delivery_id, &attempt, next_retry_at).await?;

    tracing::warn!(
        delivery_id,
        webhook_id = webhook.id,
        attempt = delivery.attempt_count,
        max_attempts = delivery.max_attempts,
        status = ?attempt.response_status,
        retry_scheduled = attempts_remaining,
        "delivery failed"
    );

    Ok(if attempts_remaining {
        ExecuteOutcome::Scheduled
    } else {
        ExecuteOutcome::Exhausted
    })
}

/// Operator retry: reset the row to a fresh pending lineage and re-enqueue
/// it. The only externally triggerable re-entry into a terminal failure.
pub async fn retry(service: &Service, org_id: &str, delivery_id: i64) -> Result<Delivery, Error> {
    let mut tx = service.db().begin().await.map_err(Error::from)?;

    let delivery = Delivery::reset_for_retry(&mut tx, org_id, delivery_id)
        .await
        .map_err(Error::internal)?
        .ok_or_else(|| Error::delivery_not_found(delivery_id, org_id))?;

    enqueue_delivery(&mut tx, delivery.id)
        .await
        .map_err(Error::internal)?;

    tx.commit().await.map_err(Error::from)?;

    Ok(delivery)
}

/// Scheduler tick: re-enqueue every failed delivery whose retry time has
/// come. Returns the number of deliveries enqueued.
pub async fn enqueue_due(service: &Service) -> eyre::Result<usize> {
    let now = chrono::Utc::now().timestamp();

    // Claim and enqueue commit together: a failed send rolls the claim back
    // so the next tick picks the delivery up again.
    let mut tx = service.db().begin().await?;
    let ids = Delivery::claim_due(&mut tx, now).await?;

    for id in &ids {
        enqueue_delivery(&mut tx, *id).await?;
    }

    tx.commit().await?;

    if !ids.is_empty() {
        tracing::info!(count = ids.len(), "re-enqueued due deliveries");
    }

    Ok(ids.len())
}

async fn enqueue_delivery(conn: &mut sqlx::SqliteConnection, delivery_id: i64) -> eyre::Result<()> {
    let body = serde_json::to_string(&WorkItem {
        function_name: FN_DELIVER_WEBHOOK.to_owned(),
        function_type: None,
        payload: serde_json::json!({ "delivery_id": delivery_id }),
    })?;

    Message::send(conn, DELIVERY_QUEUE, &body).await?;

    Ok(())
}

/// Synchronous test delivery for the dashboard: creates a real delivery row
/// with a canned payload and executes it inline.
pub async fn test_webhook(
    service: &Service,
    org_id: &str,
    webhook_id: i64,
) -> Result<Delivery, Error> {
    let mut conn = service.db().acquire().await.map_err(Error::from)?;

    let webhook = Webhook::get(&mut conn, org_id, webhook_id)
        .await
        .map_err(Error::internal)?
        .ok_or_else(|| Error::webhook_not_found(webhook_id, org_id))?;

    let payload = serde_json::json!({
        "event_type": "test",
        "org_id": org_id,
        "webhook_id": webhook.id,
        "timestamp": chrono::Utc::now().timestamp(),
        "data": { "message": "test delivery" },
    });

    let delivery = Delivery::insert_pending(
        &mut conn,
        webhook.id,
        org_id,
        None,
        "test",
        payload.to_string(),
        1,
    )
    .await
    .map_err(Error::internal)?;
    drop(conn);

    execute(service, delivery.id).await.map_err(Error::internal)?;

    let mut conn = service.db().acquire().await.map_err(Error::from)?;
    Delivery::get(&mut conn, delivery.id)
        .await
        .map_err(Error::internal)?
        .ok_or_else(|| Error::delivery_not_found(delivery.id, org_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_delay_secs(1, 60, 3600, 0), 60);
        assert_eq!(retry_delay_secs(2, 60, 3600, 0), 120);
        assert_eq!(retry_delay_secs(3, 60, 3600, 0), 240);
        assert_eq!(retry_delay_secs(10, 60, 3600, 0), 3600);
        // Degenerate configs stay sane.
        assert_eq!(retry_delay_secs(0, 60, 3600, 0), 60);
        assert_eq!(retry_delay_secs(1, 0, 3600, 0), 1);
        assert_eq!(retry_delay_secs(63, i64::MAX / 2, 10, 0), i64::MAX / 2);
    }

    #[test]
    fn backoff_jitter_stays_bounded() {
        for _ in 0..32 {
            let delay = retry_delay_secs(1, 60, 3600, 5);
            assert!((60..=65).contains(&delay));
        }
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let body = "é".repeat(RESPONSE_PREVIEW_LEN);
        let cut = preview(body);
        assert!(cut.len() <= RESPONSE_PREVIEW_LEN);
        assert!(cut.chars().all(|c| c == 'é'));

        assert_eq!(preview("ok".to_owned()), "ok");
    }
}
