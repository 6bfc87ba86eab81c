use actix_multipart::{Field, Multipart};
use actix_web::{post, web, HttpResponse};
use bytes::BytesMut;
use futures_util::StreamExt;
use serde_json::json;

use crate::camera::push::PushSink;
use crate::error::{IngestError, Result};
use crate::AppState;

/// `POST /api/ingest/push/{id}`: multipart form with `frame_file` (encoded
/// JPEG or PNG) and an optional `timestamp` in float seconds.
#[post("/ingest/push/{id}")]
async fn push_frame(
    state: web::Data<AppState>,
    path: web::Path<String>,
    mut payload: Multipart,
) -> Result<HttpResponse> {
    let camera_id = path.into_inner();
    let mut frame_file: Option<BytesMut> = None;
    let mut timestamp: Option<f64> = None;

    while let Some(field) = payload.next().await {
        let mut field = field
            .map_err(|e| IngestError::Validation(format!("invalid multipart payload: {e}")))?;
        let name = field.name().to_string();
        match name.as_str() {
            "frame_file" => frame_file = Some(read_field(&mut field).await?),
            "timestamp" => {
                let raw = read_field(&mut field).await?;
                let text = std::str::from_utf8(&raw)
                    .map_err(|_| IngestError::Validation("timestamp must be UTF-8".into()))?;
                let parsed = text.trim().parse::<f64>().map_err(|_| {
                    IngestError::Validation(format!("timestamp must be float seconds, got '{text}'"))
                })?;
                timestamp = Some(parsed);
            }
            // Unknown fields are drained and ignored.
            _ => {
                read_field(&mut field).await?;
            }
        }
    }

    let frame_file = frame_file.ok_or_else(|| {
        IngestError::Validation("multipart field 'frame_file' is required".into())
    })?;

    let sink = PushSink::new(
        state.registry.clone(),
        state.metrics.clone(),
        state.bus.clone(),
    );
    let seq = sink.ingest(&camera_id, &frame_file, timestamp)?;
    Ok(HttpResponse::Accepted().json(json!({ "seq": seq })))
}

async fn read_field(field: &mut Field) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = field.next().await {
        let chunk =
            chunk.map_err(|e| IngestError::Validation(format!("invalid multipart chunk: {e}")))?;
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(push_frame);
}
