//! Queue consumer: drains a named queue and dispatches each work item to its
//! HTTP handler, reconciling outcomes back into the queue store.
//!
//! Only successes are deleted. Failures are left in place and surface again
//! once their visibility timeout expires, so the queue store doubles as the
//! retry scheduler with a fixed backoff cadence. Messages read more than
//! [`MAX_READ_COUNT`] times are archived instead of processed, which bounds
//! redelivery amplification.

use futures_util::future::join_all;
use itertools::{Either, Itertools};
use serde::{Deserialize, Serialize};

use crate::{
    db::message::Message,
    dispatch::{DispatchOutcome, FunctionType},
    service::Service,
};

/// A message delivered this many times or fewer is still processed; past it,
/// the message is dead-lettered.
pub const MAX_READ_COUNT: i64 = 5;

/// Wire shape of a message body.
#[derive(Serialize, Deserialize, Debug)]
pub struct WorkItem {
    pub function_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_type: Option<FunctionType>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Per-invocation outcome counts, logged for observability.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub read: usize,
    pub malformed: usize,
    pub dead_lettered: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Drain one batch from `queue`.
///
/// Infallible per item: malformed bodies are skipped (and left to the
/// dead-letter rule), dispatch failures are values, and nothing an individual
/// message does can abort its siblings. Only store-level failures propagate.
pub async fn sync(service: &Service, queue: &str) -> eyre::Result<SyncReport> {
    let config = service.config();

    let batch = {
        let mut conn = service.db().acquire().await?;
        Message::read(
            &mut conn,
            queue,
            config.visibility_timeout_secs(),
            config.batch_size(),
        )
        .await?
    };

    let mut report = SyncReport {
        read: batch.len(),
        ..SyncReport::default()
    };

    let (dead_letter, live): (Vec<Message>, Vec<Message>) = batch
        .into_iter()
        .partition(|msg| msg.read_ct > MAX_READ_COUNT);

    if !dead_letter.is_empty() {
        let ids = dead_letter.iter().map(|m| m.id).collect::<Vec<_>>();
        tracing::warn!(queue, ?ids, "archiving dead-letter messages");

        let mut conn = service.db().acquire().await?;
        Message::archive(&mut conn, queue, &ids).await?;
        report.dead_lettered = ids.len();
    }

    // Malformed bodies stay in the queue for inspection; they will hit the
    // dead-letter rule on their own.
    let mut work = Vec::with_capacity(live.len());
    for msg in live {
        match serde_json::from_str::<WorkItem>(&msg.body) {
            Ok(item) => work.push((msg.id, item)),
            Err(err) => {
                tracing::error!(queue, id = msg.id, %err, "skipping malformed message");
                report.malformed += 1;
            }
        }
    }

    let table = service.dispatch_table();
    let http = service.http();

    let outcomes: Vec<(i64, DispatchOutcome)> = join_all(work.iter().map(|(id, item)| async {
        let outcome = table
            .call(http, &item.function_name, item.function_type, &item.payload)
            .await;
        (*id, outcome)
    }))
    .await;

    let (delete_ids, failures): (Vec<i64>, Vec<(i64, DispatchOutcome)>) =
        outcomes.into_iter().partition_map(|(id, outcome)| {
            if outcome.is_success() {
                Either::Left(id)
            } else {
                Either::Right((id, outcome))
            }
        });

    for (id, outcome) in &failures {
        tracing::warn!(queue, id, ?outcome, "dispatch failed, leaving for redelivery");
    }
    report.failed = failures.len();

    if !delete_ids.is_empty() {
        let mut conn = service.db().acquire().await?;
        Message::delete(&mut conn, queue, &delete_ids).await?;
    }
    report.succeeded = delete_ids.len();

    tracing::info!(
        queue,
        read = report.read,
        malformed = report.malformed,
        dead_lettered = report.dead_lettered,
        succeeded = report.succeeded,
        failed = report.failed,
        "queue sync complete"
    );

    Ok(report)
}
