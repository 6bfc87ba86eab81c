use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{get, web, HttpResponse};
use futures_util::stream;

use crate::camera::Camera;
use crate::error::{IngestError, Result};
use crate::AppState;

const FRAME_POLL_INTERVAL: Duration = Duration::from_millis(33);
const BOUNDARY: &str = "frame";

/// Live MJPEG view of one camera, served from its ring buffer: a new part is
/// emitted only when the latest sequence number advances, so idle cameras
/// idle the stream too. The stream ends when the camera is deregistered.
#[get("/cameras/{id}/stream/live.mjpeg")]
async fn live_stream(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let camera_id = path.into_inner();
    let camera = state
        .registry
        .get(&camera_id)
        .ok_or(IngestError::NotFound(camera_id))?;

    let body = stream::unfold(
        (camera, None::<u64>),
        |(camera, last_seq): (Arc<Camera>, Option<u64>)| async move {
            loop {
                if camera.cancel.is_cancelled() {
                    return None;
                }
                if let Some(frame) = camera.ring.latest() {
                    if last_seq.map_or(true, |seen| frame.seq > seen) {
                        let Ok(jpeg) = frame.encode_jpeg() else {
                            return None;
                        };
                        let mut part = Vec::with_capacity(jpeg.len() + 64);
                        part.extend_from_slice(
                            format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n").as_bytes(),
                        );
                        part.extend_from_slice(&jpeg);
                        part.extend_from_slice(b"\r\n");
                        let seq = frame.seq;
                        return Some((
                            Ok::<web::Bytes, Infallible>(web::Bytes::from(part)),
                            (camera, Some(seq)),
                        ));
                    }
                }
                tokio::time::sleep(FRAME_POLL_INTERVAL).await;
            }
        },
    );

    Ok(HttpResponse::Ok()
        .content_type(format!("multipart/x-mixed-replace; boundary={BOUNDARY}"))
        .streaming(body))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(live_stream);
}
