//! Dashboard surface for webhook subscriptions.

use actix_web::{delete, get, post, put, web, Responder, Scope};
use serde::Serialize;

use crate::{
    db::webhook::{Webhook, WebhookParams},
    delivery,
    error::Error,
    service::Service,
};

#[derive(Serialize)]
struct ListWebhooksResponse {
    webhooks: Vec<Webhook>,
}

#[get("")]
async fn list_webhooks(
    service: web::Data<Service>,
    path: web::Path<String>,
) -> actix_web::Result<impl Responder> {
    let mut conn = service.db().acquire().await.map_err(Error::from)?;

    let webhooks = Webhook::list(&mut conn, &*path)
        .await
        .map_err(Error::internal)?;

    Ok(web::Json(ListWebhooksResponse { webhooks }))
}

#[post("")]
async fn create_webhook(
    service: web::Data<Service>,
    path: web::Path<String>,
    params: web::Json<WebhookParams>,
) -> actix_web::Result<impl Responder> {
    params.validate()?;

    let mut conn = service.db().acquire().await.map_err(Error::from)?;

    let webhook = Webhook::insert(&mut conn, &*path, &params)
        .await
        .map_err(Error::internal)?;

    Ok(web::Json(webhook))
}

#[get("/{id}")]
async fn get_webhook(
    service: web::Data<Service>,
    path: web::Path<(String, i64)>,
) -> actix_web::Result<impl Responder> {
    let (org_id, id) = path.into_inner();

    let mut conn = service.db().acquire().await.map_err(Error::from)?;

    let webhook = Webhook::get(&mut conn, &org_id, id)
        .await
        .map_err(Error::internal)?
        .ok_or_else(|| Error::webhook_not_found(id, &org_id))?;

    Ok(web::Json(webhook))
}

#[put("/{id}")]
async fn update_webhook(
    service: web::Data<Service>,
    path: web::Path<(String, i64)>,
    params: web::Json<WebhookParams>,
) -> actix_web::Result<impl Responder> {
    params.validate()?;

    let (org_id, id) = path.into_inner();

    let mut conn = service.db().acquire().await.map_err(Error::from)?;

    let webhook = Webhook::update(&mut conn, &org_id, id, &params)
        .await
        .map_err(Error::internal)?
        .ok_or_else(|| Error::webhook_not_found(id, &org_id))?;

    Ok(web::Json(webhook))
}

#[delete("/{id}")]
async fn delete_webhook(
    service: web::Data<Service>,
    path: web::Path<(String, i64)>,
) -> actix_web::Result<impl Responder> {
    let (org_id, id) = path.into_inner();

    let mut conn = service.db().acquire().await.map_err(Error::from)?;

    if !Webhook::delete(&mut conn, &org_id, id)
        .await
        .map_err(Error::internal)?
    {
        return Err(Error::webhook_not_found(id, &org_id).into());
    }

    Ok("OK")
}

#[derive(Serialize)]
struct ToggleResponse {
    enabled: bool,
}

#[post("/{id}/toggle")]
async fn toggle_webhook(
    service: web::Data<Service>,
    path: web::Path<(String, i64)>,
) -> actix_web::Result<impl Responder> {
    let (org_id, id) = path.into_inner();

    let mut conn = service.db().acquire().await.map_err(Error::from)?;

    let enabled = Webhook::toggle(&mut conn, &org_id, id)
        .await
        .map_err(Error::internal)?
        .ok_or_else(|| Error::webhook_not_found(id, &org_id))?;

    Ok(web::Json(ToggleResponse { enabled }))
}

/// Synchronous test delivery; the caller gets the recorded outcome back.
#[post("/{id}/test")]
async fn test_webhook(
    service: web::Data<Service>,
    path: web::Path<(String, i64)>,
) -> actix_web::Result<impl Responder> {
    let (org_id, id) = path.into_inner();

    let delivery = delivery::test_webhook(&service, &org_id, id).await?;

    Ok(web::Json(delivery))
}

pub fn service() -> Scope {
    web::scope("/orgs/{org_id}/webhooks")
        .service(list_webhooks)
        .service(create_webhook)
        .service(get_webhook)
        .service(update_webhook)
        .service(delete_webhook)
        .service(toggle_webhook)
        .service(test_webhook)
}
