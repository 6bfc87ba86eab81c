use std::sync::Arc;

use tracing::warn;

use crate::camera::registry::CameraRegistry;
use crate::error::{IngestError, Result};
use crate::frame::{unix_now, SourceType};
use crate::messaging::EventBus;
use crate::metrics::Metrics;

/// Accepts externally supplied encoded frames for `http_push` cameras.
pub struct PushSink {
    registry: Arc<CameraRegistry>,
    metrics: Arc<Metrics>,
    bus: Arc<EventBus>,
}

impl PushSink {
    pub fn new(registry: Arc<CameraRegistry>, metrics: Arc<Metrics>, bus: Arc<EventBus>) -> Self {
        Self {
            registry,
            metrics,
            bus,
        }
    }

    /// Decode `payload` (JPEG or PNG) and run it through the camera's ingest
    /// path. `timestamp` defaults to server time. Two identical pushes
    /// produce two frames; there is no dedup.
    pub fn ingest(&self, camera_id: &str, payload: &[u8], timestamp: Option<f64>) -> Result<u64> {
        let camera = self
            .registry
            .get(camera_id)
            .ok_or_else(|| IngestError::NotFound(camera_id.to_string()))?;
        if camera.source_type() != SourceType::HttpPush {
            return Err(IngestError::WrongSourceType(camera_id.to_string()));
        }

        let image = match image::load_from_memory(payload) {
            Ok(decoded) => decoded.to_rgb8(),
            Err(e) => {
                self.metrics
                    .decode_errors_total
                    .with_label_values(&[camera_id])
                    .inc();
                warn!(camera_id, error = %e, "rejected undecodable pushed frame");
                return Err(IngestError::BadFrame(e.to_string()));
            }
        };

        let timestamp = timestamp.unwrap_or_else(unix_now);
        Ok(camera.ingest_frame(image, timestamp, &self.metrics, &self.bus))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::rtsp::UnsupportedSessionFactory;
    use crate::camera::CameraSpec;
    use crate::config::IngestConfig;
    use crate::messaging::testing::RecordingTransport;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    struct Fixture {
        sink: PushSink,
        registry: Arc<CameraRegistry>,
        metrics: Arc<Metrics>,
    }

    fn fixture() -> Fixture {
        let metrics = Arc::new(Metrics::new().unwrap());
        let transport = RecordingTransport::new();
        let bus = Arc::new(EventBus::new(transport, 64, metrics.clone()));
        let registry = Arc::new(CameraRegistry::new(
            IngestConfig::default(),
            metrics.clone(),
            bus.clone(),
            Arc::new(UnsupportedSessionFactory),
        ));
        let sink = PushSink::new(registry.clone(), metrics.clone(), bus);
        Fixture {
            sink,
            registry,
            metrics,
        }
    }

    fn spec(id: &str, source_type: SourceType) -> CameraSpec {
        CameraSpec {
            id: id.to_string(),
            source_type,
            source_url: (source_type == SourceType::Rtsp)
                .then(|| "rtsp://example.com/stream".to_string()),
            buffer_size: None,
            motion_threshold: None,
            motion_area_min: None,
            motion_cooldown_seconds: None,
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([1, 2, 3]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn unknown_camera_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.sink.ingest("missing", &png_bytes(4, 4), None),
            Err(IngestError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rtsp_camera_rejects_pushes() {
        let f = fixture();
        f.registry
            .register(spec("cam_rtsp", SourceType::Rtsp))
            .await
            .unwrap();
        assert!(matches!(
            f.sink.ingest("cam_rtsp", &png_bytes(4, 4), None),
            Err(IngestError::WrongSourceType(_))
        ));
        f.registry.deregister("cam_rtsp").await.unwrap();
    }

    #[tokio::test]
    async fn corrupted_payload_is_bad_frame_and_counted() {
        let f = fixture();
        f.registry
            .register(spec("cam_push", SourceType::HttpPush))
            .await
            .unwrap();

        let err = f
            .sink
            .ingest("cam_push", b"definitely not an image", None)
            .unwrap_err();
        assert!(matches!(err, IngestError::BadFrame(_)));
        assert_eq!(
            f.metrics
                .decode_errors_total
                .with_label_values(&["cam_push"])
                .get(),
            1
        );
        // Nothing reached the ring.
        assert!(matches!(
            f.registry.latest_frame("cam_push").unwrap_err(),
            IngestError::NoFrameYet
        ));
    }

    #[tokio::test]
    async fn pushed_frame_keeps_explicit_timestamp_and_sequences() {
        let f = fixture();
        f.registry
            .register(spec("cam_push", SourceType::HttpPush))
            .await
            .unwrap();

        let seq = f
            .sink
            .ingest("cam_push", &png_bytes(64, 48), Some(1_700_000_000.0))
            .unwrap();
        assert_eq!(seq, 0);

        let frame = f.registry.latest_frame("cam_push").unwrap();
        assert_eq!(frame.timestamp, 1_700_000_000.0);
        assert_eq!(frame.width(), 64);
        assert_eq!(frame.height(), 48);
        assert_eq!(frame.source, SourceType::HttpPush);

        // Idempotence is not required: a second push is a second frame.
        let seq = f
            .sink
            .ingest("cam_push", &png_bytes(64, 48), Some(1_700_000_001.0))
            .unwrap();
        assert_eq!(seq, 1);
    }

    #[tokio::test]
    async fn omitted_timestamp_defaults_to_server_time() {
        let f = fixture();
        f.registry
            .register(spec("cam_push", SourceType::HttpPush))
            .await
            .unwrap();

        let before = unix_now();
        f.sink.ingest("cam_push", &png_bytes(8, 8), None).unwrap();
        let after = unix_now();

        let timestamp = f.registry.latest_frame("cam_push").unwrap().timestamp;
        assert!(timestamp >= before && timestamp <= after);
    }

    // The control plane runs one handler thread per core, so pushes to the
    // same camera can arrive in parallel. Sequence order and ring order must
    // still agree.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pushes_keep_seq_and_ring_order_consistent() {
        let f = fixture();
        let mut camera = spec("cam_push", SourceType::HttpPush);
        camera.buffer_size = Some(128);
        f.registry.register(camera).await.unwrap();

        let registry = f.registry.clone();
        let metrics = f.metrics.clone();
        let sink = Arc::new(f.sink);
        let payload = Arc::new(png_bytes(16, 16));

        let mut handles = Vec::new();
        for task in 0..8u64 {
            let sink = sink.clone();
            let payload = payload.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..8u64 {
                    sink.ingest("cam_push", &payload, Some((task * 8 + i) as f64))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let ring = registry.get("cam_push").unwrap().ring.clone();
        let seqs: Vec<u64> = ring.snapshot(128).iter().map(|frame| frame.seq).collect();
        assert_eq!(seqs.len(), 64);
        // Capacity exceeds the push count, so the ring holds every frame and
        // append order must be exactly 0..=63.
        assert_eq!(seqs, (0..64).collect::<Vec<u64>>());
        assert_eq!(
            metrics
                .frames_ingested_total
                .with_label_values(&["cam_push", "http_push"])
                .get(),
            64
        );
    }
}
