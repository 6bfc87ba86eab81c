mod cameras;
mod ingest;
mod streams;

use actix_web::{get, web, HttpResponse};
use serde_json::json;

use crate::error::Result;
use crate::AppState;

#[get("/metrics")]
async fn metrics(state: web::Data<AppState>) -> Result<HttpResponse> {
    let body = state.metrics.gather()?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(body))
}

#[get("/health")]
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": "camera-ingest",
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(metrics).service(
        web::scope("/api")
            .service(health)
            .configure(cameras::configure)
            .configure(ingest::configure)
            .configure(streams::configure),
    );
}
