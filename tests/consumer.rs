//! Queue consumer behavior: partitioning, dead-lettering, reconciliation.

mod common;

use common::{setup_with, StubServer, TmpService};
use hookline::{consumer::WorkItem, db::message::Message};
use url::Url;

fn work_item(function_name: &str) -> String {
    serde_json::to_string(&WorkItem {
        function_name: function_name.to_owned(),
        function_type: None,
        payload: serde_json::json!({}),
    })
    .unwrap()
}

async fn setup_against(stub: &StubServer) -> TmpService {
    let url = Url::parse(&stub.url("/")).unwrap();
    setup_with(move |config| {
        config.dispatch_url = Some(url);
        config.visibility_timeout_secs = Some(1);
        config.dispatch_timeout_secs = Some(2);
    })
    .await
}

#[tokio::test]
async fn successes_deleted_failures_left_for_redelivery() {
    // Scenario A: two 2xx dispatches, one 500.
    let stub = StubServer::start(|path| if path.contains("boom") { 500 } else { 200 }).await;
    let service = setup_against(&stub).await;

    service.enqueue("jobs", work_item("ok_a")).await.unwrap();
    service.enqueue("jobs", work_item("ok_b")).await.unwrap();
    let boom_id = service.enqueue("jobs", work_item("boom")).await.unwrap();

    let report = service.sync("jobs").await.unwrap();
    assert_eq!(report.read, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.dead_lettered, 0);
    assert_eq!(stub.hit_count(), 3);

    // The failure reappears after the visibility window, read count bumped.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    let mut conn = service.db().acquire().await.unwrap();
    let batch = Message::read(&mut conn, "jobs", 30, 10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, boom_id);
    assert_eq!(batch[0].read_ct, 2);
}

#[tokio::test]
async fn exhausted_messages_archived_without_dispatch() {
    // Scenario B: read_count past the dead-letter threshold.
    let stub = StubServer::start(|_| 200).await;
    let service = setup_against(&stub).await;

    let id = service.enqueue("jobs", work_item("ok")).await.unwrap();

    sqlx::query("UPDATE messages SET read_ct = 6 WHERE id = $1")
        .bind(id)
        .execute(service.db())
        .await
        .unwrap();

    let report = service.sync("jobs").await.unwrap();
    assert_eq!(report.read, 1);
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed, 0);

    // Archived immediately, dispatch never attempted.
    assert_eq!(stub.hit_count(), 0);

    let mut conn = service.db().acquire().await.unwrap();
    assert_eq!(Message::archived_count(&mut conn, "jobs").await.unwrap(), 1);
}

#[tokio::test]
async fn batch_partition_is_complete_and_disjoint() {
    let stub = StubServer::start(|_| 200).await;
    let service = setup_against(&stub).await;

    for n in 0..4 {
        let id = service
            .enqueue("jobs", work_item(&format!("fn_{n}")))
            .await
            .unwrap();
        if n % 2 == 0 {
            sqlx::query("UPDATE messages SET read_ct = 7 WHERE id = $1")
                .bind(id)
                .execute(service.db())
                .await
                .unwrap();
        }
    }

    let report = service.sync("jobs").await.unwrap();
    assert_eq!(report.read, 4);
    assert_eq!(report.dead_lettered, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(
        report.read,
        report.dead_lettered + report.malformed + report.succeeded + report.failed
    );

    // Dead-letters were never dispatched.
    assert_eq!(stub.hit_count(), 2);
}

#[tokio::test]
async fn malformed_messages_skipped_without_aborting_batch() {
    let stub = StubServer::start(|_| 200).await;
    let service = setup_against(&stub).await;

    service.enqueue("jobs", "not json at all").await.unwrap();
    service.enqueue("jobs", r#"{"payload":{}}"#).await.unwrap();
    service.enqueue("jobs", work_item("ok")).await.unwrap();

    let report = service.sync("jobs").await.unwrap();
    assert_eq!(report.read, 3);
    assert_eq!(report.malformed, 2);
    assert_eq!(report.succeeded, 1);

    // Malformed messages are left in the queue, not deleted.
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE queue = 'jobs'")
        .fetch_one(service.db())
        .await
        .unwrap();
    assert_eq!(remaining, 2);
}

#[tokio::test]
async fn unreachable_target_is_failure_not_error() {
    // Port from a listener we immediately drop: connection refused.
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let url = Url::parse(&format!("http://{addr}/")).unwrap();
    let service = setup_with(move |config| {
        config.dispatch_url = Some(url);
        config.dispatch_timeout_secs = Some(2);
    })
    .await;

    service.enqueue("jobs", work_item("ok")).await.unwrap();

    let report = service.sync("jobs").await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 0);
}

#[tokio::test]
async fn dispatch_carries_secret_header_and_payload() {
    let stub = StubServer::start(|_| 200).await;
    let service = setup_against(&stub).await;

    let body = serde_json::to_string(&WorkItem {
        function_name: "on_change_event".to_owned(),
        function_type: None,
        payload: serde_json::json!({"org_id": "o1"}),
    })
    .unwrap();
    service.enqueue("jobs", body).await.unwrap();

    let report = service.sync("jobs").await.unwrap();
    assert_eq!(report.succeeded, 1);

    let req = stub.last_request().await.unwrap();
    assert_eq!(req.path, "/triggers/on_change_event");
    assert_eq!(req.header("x-api-secret"), Some("test-secret"));

    let payload: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
    assert_eq!(payload["org_id"], "o1");
}
