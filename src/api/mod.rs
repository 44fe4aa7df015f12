pub mod service;

use actix_web::{get, web, Responder};
use tracing::debug;

use crate::api::service::{StatusService, StatusServiceTrait};

#[get("/stats_raw")]
pub async fn stats_raw_route(api_service: web::Data<StatusService>) -> impl Responder {
    debug!("Received HTTP /stats_raw request");

    let service = api_service.get_ref();
    web::Json(service.stats_raw().await)
}

#[get("/stats")]
pub async fn stats_route(api_service: web::Data<StatusService>) -> impl Responder {
    debug!("Received HTTP /stats request");

    let service = api_service.get_ref();
    web::Json(service.stats().await)
}
