//! Internal dispatch targets: the endpoints the dispatch table routes queue
//! messages to, one path segment per logical function name.

use actix_web::{post, web, Responder, Scope};
use serde::{Deserialize, Serialize};

use crate::{
    delivery::{self, FN_ENQUEUE_DUE_RETRIES},
    error::Error,
    fanout::{self, ChangeEvent, FN_DELIVER_WEBHOOK, FN_ON_CHANGE_EVENT},
    service::Service,
};

#[derive(Debug, Serialize)]
struct Ack {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    enqueued: Option<usize>,
}

impl Ack {
    fn ok() -> Self {
        Self {
            status: "ok",
            enqueued: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeliverRequest {
    delivery_id: i64,
}

#[post("/{function_name}")]
async fn trigger(
    service: web::Data<Service>,
    path: web::Path<String>,
    body: web::Json<serde_json::Value>,
) -> actix_web::Result<impl Responder> {
    let function_name = path.into_inner();
    let body = body.into_inner();

    match function_name.as_str() {
        // Always acknowledges with a success envelope: zero matches and
        // per-subscription failures must not cause queue-level retry storms.
        FN_ON_CHANGE_EVENT => {
            match ChangeEvent::from_trigger_body(&body) {
                Ok(event) => {
                    fanout::dispatch(&service, &event)
                        .await
                        .map_err(Error::internal)?;
                }
                Err(err) => {
                    tracing::error!(%err, "discarding malformed change event");
                }
            }

            Ok(web::Json(Ack::ok()))
        }

        FN_DELIVER_WEBHOOK => {
            let req: DeliverRequest = serde_json::from_value(body)
                .map_err(|e| Error::invalid_parameter(format!("delivery_id: {e}")))?;

            delivery::execute(&service, req.delivery_id)
                .await
                .map_err(Error::internal)?;

            Ok(web::Json(Ack::ok()))
        }

        FN_ENQUEUE_DUE_RETRIES => {
            let enqueued = delivery::enqueue_due(&service)
                .await
                .map_err(Error::internal)?;

            Ok(web::Json(Ack {
                status: "ok",
                enqueued: Some(enqueued),
            }))
        }

        other => Err(Error::not_found(format!("trigger function {other}")).into()),
    }
}

pub fn service() -> Scope {
    web::scope("/triggers").service(trigger)
}
