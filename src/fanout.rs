//! Webhook matcher: turns one normalized change event into zero-or-more
//! pending deliveries, each enqueued as its own queue message.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::{
    consumer::WorkItem,
    db::{delivery::Delivery, message::Message, webhook::Webhook},
    service::Service,
};

/// Queue carrying individual delivery tasks produced by the fan-out stage.
pub const DELIVERY_QUEUE: &str = "webhook_deliveries";

/// Queue the database outbox writes change events onto.
pub const CHANGE_EVENT_QUEUE: &str = "change_events";

/// Trigger function names routed by the queue consumer.
pub const FN_ON_CHANGE_EVENT: &str = "on_change_event";
pub const FN_DELIVER_WEBHOOK: &str = "deliver_webhook";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// Normalized input to the matcher, produced once per database mutation.
/// Matching is a pure read, so redelivered events are safe to redo.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChangeEvent {
    pub org_id: String,
    pub table_name: String,
    pub operation: Operation,
    #[serde(default)]
    pub record_id: Option<String>,
    #[serde(default)]
    pub audit_log_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ChangeEvent {
    pub fn event_type(&self) -> String {
        format!("{}.{}", self.table_name, self.operation)
    }

    /// Parse an event from a trigger body, accepting both the bare event and
    /// the `{ "payload": event }` envelope used by queue producers.
    pub fn from_trigger_body(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        struct Envelope {
            payload: ChangeEvent,
        }

        match serde_json::from_value::<Envelope>(value.clone()) {
            Ok(envelope) => Ok(envelope.payload),
            Err(_) => serde_json::from_value(value.clone()),
        }
    }
}

/// Canonical outbound payload. Field order is the wire order subscribers
/// sign against, so it must stay stable.
#[derive(Serialize, Debug)]
pub struct WebhookPayload<'a> {
    pub event_type: String,
    pub org_id: &'a str,
    pub table_name: &'a str,
    pub operation: Operation,
    pub record_id: Option<&'a str>,
    pub audit_log_id: Option<&'a str>,
    pub timestamp: i64,
    pub data: &'a serde_json::Value,
}

impl<'a> WebhookPayload<'a> {
    pub fn from_event(event: &'a ChangeEvent, timestamp: i64) -> Self {
        Self {
            event_type: event.event_type(),
            org_id: &event.org_id,
            table_name: &event.table_name,
            operation: event.operation,
            record_id: event.record_id.as_deref(),
            audit_log_id: event.audit_log_id.as_deref(),
            timestamp,
            data: &event.payload,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FanOutReport {
    pub matched: usize,
    pub enqueued: usize,
    pub skipped: usize,
}

/// Fan one event out to every enabled, matching subscription.
///
/// Each subscription gets a pending [`Delivery`] row plus one queue message
/// carrying its delivery id. Per-subscription failures are logged and
/// counted, never propagated; siblings proceed regardless.
pub async fn dispatch(service: &Service, event: &ChangeEvent) -> eyre::Result<FanOutReport> {
    let webhooks = {
        let mut conn = service.db().acquire().await?;
        Webhook::list_enabled_for_event(
            &mut conn,
            &event.org_id,
            &event.table_name,
            event.operation.to_string(),
        )
        .await?
    };

    let mut report = FanOutReport {
        matched: webhooks.len(),
        ..FanOutReport::default()
    };

    if webhooks.is_empty() {
        tracing::debug!(
            org_id = %event.org_id,
            event_type = %event.event_type(),
            "no enabled subscriptions match"
        );
        return Ok(report);
    }

    let payload = serde_json::to_string(&WebhookPayload::from_event(
        event,
        chrono::Utc::now().timestamp(),
    ))?;

    let results = join_all(
        webhooks
            .iter()
            .map(|webhook| fan_out_one(service, event, webhook, &payload)),
    )
    .await;

    for (webhook, result) in webhooks.iter().zip(results) {
        match result {
            Ok(()) => report.enqueued += 1,
            Err(err) => {
                tracing::error!(
                    org_id = %event.org_id,
                    webhook_id = webhook.id,
                    %err,
                    "skipping subscription, siblings unaffected"
                );
                report.skipped += 1;
            }
        }
    }

    tracing::info!(
        org_id = %event.org_id,
        event_type = %event.event_type(),
        matched = report.matched,
        enqueued = report.enqueued,
        skipped = report.skipped,
        "fan-out complete"
    );

    Ok(report)
}

async fn fan_out_one(
    service: &Service,
    event: &ChangeEvent,
    webhook: &Webhook,
    payload: &str,
) -> eyre::Result<()> {
    // The pending row and its queue message commit together; a failure on
    // either side leaves no stranded half.
    let mut tx = service.db().begin().await?;

    let delivery = Delivery::insert_pending(
        &mut tx,
        webhook.id,
        &event.org_id,
        event.audit_log_id.as_deref(),
        event.event_type(),
        payload,
        service.config().delivery_max_attempts(),
    )
    .await?;

    let body = serde_json::to_string(&WorkItem {
        function_name: FN_DELIVER_WEBHOOK.to_owned(),
        function_type: None,
        payload: serde_json::json!({ "delivery_id": delivery.id }),
    })?;

    Message::send(&mut tx, DELIVERY_QUEUE, &body).await?;

    tx.commit().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_format() {
        let event = ChangeEvent {
            org_id: "org".to_owned(),
            table_name: "apps".to_owned(),
            operation: Operation::Update,
            record_id: None,
            audit_log_id: None,
            payload: serde_json::Value::Null,
        };
        assert_eq!(event.event_type(), "apps.update");
    }

    #[test]
    fn trigger_body_accepts_envelope_and_bare() {
        let bare = serde_json::json!({
            "org_id": "o1",
            "table_name": "apps",
            "operation": "insert",
        });
        let event = ChangeEvent::from_trigger_body(&bare).unwrap();
        assert_eq!(event.org_id, "o1");

        let enveloped = serde_json::json!({ "payload": bare });
        let event = ChangeEvent::from_trigger_body(&enveloped).unwrap();
        assert_eq!(event.table_name, "apps");

        let missing = serde_json::json!({ "table_name": "apps" });
        assert!(ChangeEvent::from_trigger_body(&missing).is_err());
    }

    #[test]
    fn canonical_payload_field_order() {
        let event = ChangeEvent {
            org_id: "o1".to_owned(),
            table_name: "channels".to_owned(),
            operation: Operation::Delete,
            record_id: Some("ch_9".to_owned()),
            audit_log_id: Some("al_4".to_owned()),
            payload: serde_json::json!({"name": "beta"}),
        };

        let json = serde_json::to_string(&WebhookPayload::from_event(&event, 1700000000)).unwrap();
        assert!(json.starts_with(r#"{"event_type":"channels.delete","org_id":"o1""#));
        assert!(json.contains(r#""timestamp":1700000000"#));
    }
}
