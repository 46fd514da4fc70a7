//! Dashboard surface for delivery status queries and manual retry.

use actix_web::{get, post, web, Responder, Scope};
use serde::{Deserialize, Serialize};

use crate::{
    db::delivery::{Delivery, DeliveryStatus},
    delivery,
    error::Error,
    service::Service,
};

const DEFAULT_PER_PAGE: u32 = 25;
const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub webhook_id: Option<i64>,
    pub status: Option<DeliveryStatus>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
    pub has_more: bool,
}

#[get("")]
async fn list_deliveries(
    service: web::Data<Service>,
    path: web::Path<String>,
    query: web::Query<ListQuery>,
) -> actix_web::Result<impl Responder> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query
        .per_page
        .unwrap_or(DEFAULT_PER_PAGE)
        .clamp(1, MAX_PER_PAGE);

    let mut conn = service.db().acquire().await.map_err(Error::from)?;

    let (data, total) = Delivery::list_page(
        &mut conn,
        &*path,
        query.webhook_id,
        query.status,
        page,
        per_page,
    )
    .await
    .map_err(Error::internal)?;

    let has_more = i64::from(page) * i64::from(per_page) < total;

    Ok(web::Json(Page {
        data,
        page,
        per_page,
        total,
        has_more,
    }))
}

#[get("/{id}")]
async fn get_delivery(
    service: web::Data<Service>,
    path: web::Path<(String, i64)>,
) -> actix_web::Result<impl Responder> {
    let (org_id, id) = path.into_inner();

    let mut conn = service.db().acquire().await.map_err(Error::from)?;

    let delivery = Delivery::get_scoped(&mut conn, &org_id, id)
        .await
        .map_err(Error::internal)?
        .ok_or_else(|| Error::delivery_not_found(id, &org_id))?;

    Ok(web::Json(delivery))
}

#[post("/{id}/retry")]
async fn retry_delivery(
    service: web::Data<Service>,
    path: web::Path<(String, i64)>,
) -> actix_web::Result<impl Responder> {
    let (org_id, id) = path.into_inner();

    let delivery = delivery::retry(&service, &org_id, id).await?;

    Ok(web::Json(delivery))
}

pub fn service() -> Scope {
    web::scope("/orgs/{org_id}/deliveries")
        .service(list_deliveries)
        .service(get_delivery)
        .service(retry_delivery)
}
