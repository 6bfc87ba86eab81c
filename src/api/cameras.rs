use actix_web::{delete, get, post, web, HttpResponse};
use serde_json::json;

use crate::camera::CameraSpec;
use crate::error::Result;
use crate::AppState;

#[post("/cameras")]
async fn register_camera(
    state: web::Data<AppState>,
    spec: web::Json<CameraSpec>,
) -> Result<HttpResponse> {
    let camera = state.registry.register(spec.into_inner()).await?;
    Ok(HttpResponse::Created().json(json!({ "id": camera.id() })))
}

#[get("/cameras")]
async fn list_cameras(state: web::Data<AppState>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.registry.list()))
}

#[delete("/cameras/{id}")]
async fn deregister_camera(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    state.registry.deregister(&path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[get("/cameras/{id}/frame/latest")]
async fn latest_frame(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let frame = state.registry.latest_frame(&path.into_inner())?;
    Ok(HttpResponse::Ok()
        .content_type("image/jpeg")
        .body(frame.encode_jpeg()?))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(register_camera)
        .service(list_cameras)
        .service(deregister_camera)
        .service(latest_frame);
}
