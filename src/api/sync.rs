//! Trigger entry point for draining a queue.
//!
//! Returns `202 Accepted` immediately; the batch runs as a tracked
//! background task so the caller (a scheduler tick or an on-demand trigger)
//! never waits on downstream HTTP calls.

use actix_web::{post, web, HttpResponse, Responder, Scope};
use serde::{Deserialize, Serialize};

use crate::{error::Error, service::Service};

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncRequest {
    pub queue_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncAccepted {
    pub status: &'static str,
    pub queue_name: String,
}

#[post("")]
async fn trigger_sync(
    service: web::Data<Service>,
    body: web::Json<SyncRequest>,
) -> actix_web::Result<impl Responder> {
    let queue = body.into_inner().queue_name;

    if queue.is_empty() {
        return Err(Error::missing_parameter("queue_name").into());
    }

    let svc = service.into_inner();
    let tasks = svc.tasks().clone();
    let task_queue = queue.clone();

    // Failures past this point are logged, never surfaced to the caller.
    tasks.spawn(async move {
        if let Err(err) = svc.sync(&task_queue).await {
            tracing::error!(queue = %task_queue, %err, "queue sync failed");
        }
    });

    Ok(HttpResponse::Accepted().json(SyncAccepted {
        status: "accepted",
        queue_name: queue,
    }))
}

pub fn service() -> Scope {
    web::scope("/sync").service(trigger_sync)
}
