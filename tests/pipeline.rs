//! End-to-end flow through a real HTTP server: change event on the queue,
//! self-dispatch to the trigger endpoint, fan-out, then signed delivery to a
//! subscriber.

mod common;

use actix_cors::Cors;
use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::JsonConfig,
    App, HttpServer,
};
use common::{setup_data_with, StubServer};
use hookline::{
    api,
    consumer::WorkItem,
    db::{
        delivery::{Delivery, DeliveryStatus},
        webhook::{Webhook, WebhookParams},
    },
    fanout::{CHANGE_EVENT_QUEUE, DELIVERY_QUEUE, FN_ON_CHANGE_EVENT},
    signing,
};

#[actix_web::test]
async fn change_event_flows_to_subscriber() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let (_tmp, data) = setup_data_with(|config| {
        config.dispatch_url = Some(format!("http://{addr}").parse().unwrap());
        config.dispatch_timeout_secs = Some(5);
    })
    .await;

    let app_data = data.clone();
    let server = HttpServer::new(move || {
        App::new()
            .wrap(api::auth::SecretAuth)
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .wrap(Cors::permissive())
            .service(api::sync::service())
            .service(api::triggers::service())
            .service(api::webhooks::service())
            .service(api::deliveries::service())
            .app_data(app_data.clone())
            .app_data(JsonConfig::default().content_type_required(false))
    })
    .workers(1)
    .listen(listener)
    .unwrap()
    .run();
    let handle = server.handle();
    actix_web::rt::spawn(server);

    let subscriber = StubServer::start(|_| 200).await;

    {
        let mut conn = data.db().acquire().await.unwrap();
        Webhook::insert(
            &mut conn,
            "org_1",
            &WebhookParams {
                name: "release feed".to_owned(),
                url: subscriber.url("/hooks/releases"),
                secret: "sub-secret".to_owned(),
                enabled: true,
                events: vec!["app_versions".to_owned()],
            },
        )
        .await
        .unwrap();
    }

    // The outbox producer writes one work item per database mutation.
    let body = serde_json::to_string(&WorkItem {
        function_name: FN_ON_CHANGE_EVENT.to_owned(),
        function_type: None,
        payload: serde_json::json!({
            "org_id": "org_1",
            "table_name": "app_versions",
            "operation": "insert",
            "record_id": "ver_42",
            "payload": {"version": "1.4.0"},
        }),
    })
    .unwrap();
    data.enqueue(CHANGE_EVENT_QUEUE, &body).await.unwrap();

    // First drain: the change event round-trips through the HTTP trigger and
    // fans out into one pending delivery.
    let report = data.sync(CHANGE_EVENT_QUEUE).await.unwrap();
    assert_eq!(report.read, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(subscriber.hit_count(), 0);

    // Second drain: the delivery task posts to the subscriber.
    let report = data.sync(DELIVERY_QUEUE).await.unwrap();
    assert_eq!(report.read, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(subscriber.hit_count(), 1);

    let request = subscriber.last_request().await.unwrap();
    assert_eq!(request.path, "/hooks/releases");

    let timestamp: i64 = request
        .header(signing::TIMESTAMP_HEADER)
        .unwrap()
        .parse()
        .unwrap();
    let signature = request.header(signing::SIGNATURE_HEADER).unwrap();
    assert!(signing::verify_signature(
        b"sub-secret",
        &request.body,
        timestamp,
        signature,
    ));

    let payload: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(payload["event_type"], "app_versions.insert");
    assert_eq!(payload["record_id"], "ver_42");
    assert_eq!(payload["data"]["version"], "1.4.0");

    let mut conn = data.db().acquire().await.unwrap();
    let delivery = Delivery::get(&mut conn, 1).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempt_count, 1);
    assert_eq!(delivery.response_status, Some(200));

    handle.stop(true).await;
}
