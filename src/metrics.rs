use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::error::{IngestError, Result};

const EVENT_KINDS: [&str; 4] = [
    "camera.connected",
    "camera.disconnected",
    "frame.ingested",
    "motion.detected",
];
const SOURCES: [&str; 2] = ["rtsp", "http_push"];

/// Process-wide metric families, constructed once at startup and passed
/// around as `Arc<Metrics>`.
pub struct Metrics {
    registry: Registry,

    pub frames_ingested_total: IntCounterVec,
    pub decode_errors_total: IntCounterVec,
    pub motion_events_total: IntCounterVec,
    pub motion_frames_dropped_total: IntCounterVec,
    pub events_published_total: IntCounterVec,
    pub events_dropped_total: IntCounterVec,
    pub rtsp_reconnects_total: IntCounterVec,
    pub camera_state: IntGaugeVec,
    pub ring_buffer_fill: IntGaugeVec,
    pub frame_ingest_latency_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let frames_ingested_total = IntCounterVec::new(
            Opts::new("frames_ingested_total", "Frames appended to ring buffers"),
            &["camera_id", "source"],
        )?;
        let decode_errors_total = IntCounterVec::new(
            Opts::new("decode_errors_total", "Frames that failed to decode"),
            &["camera_id"],
        )?;
        let motion_events_total = IntCounterVec::new(
            Opts::new("motion_events_total", "Motion events emitted"),
            &["camera_id"],
        )?;
        let motion_frames_dropped_total = IntCounterVec::new(
            Opts::new(
                "motion_frames_dropped_total",
                "Frames evicted from the motion stage input queue",
            ),
            &["camera_id"],
        )?;
        let events_published_total = IntCounterVec::new(
            Opts::new("events_published_total", "Events delivered to the bus"),
            &["camera_id", "type"],
        )?;
        let events_dropped_total = IntCounterVec::new(
            Opts::new(
                "events_dropped_total",
                "Events dropped on queue overflow or transport failure",
            ),
            &["camera_id", "type"],
        )?;
        let rtsp_reconnects_total = IntCounterVec::new(
            Opts::new("rtsp_reconnects_total", "RTSP reconnect attempts scheduled"),
            &["camera_id"],
        )?;
        let camera_state = IntGaugeVec::new(
            Opts::new(
                "camera_state",
                "Camera lifecycle state (0=registering, 1=connecting, 2=connected, \
                 3=disconnected, 4=stopped)",
            ),
            &["camera_id"],
        )?;
        let ring_buffer_fill = IntGaugeVec::new(
            Opts::new("ring_buffer_fill", "Frames currently held in the ring buffer"),
            &["camera_id"],
        )?;
        let frame_ingest_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "frame_ingest_latency_seconds",
                "Latency from capture timestamp to ring buffer append",
            )
            .buckets(prometheus::exponential_buckets(0.001, 2.0, 12)?),
        )?;

        registry.register(Box::new(frames_ingested_total.clone()))?;
        registry.register(Box::new(decode_errors_total.clone()))?;
        registry.register(Box::new(motion_events_total.clone()))?;
        registry.register(Box::new(motion_frames_dropped_total.clone()))?;
        registry.register(Box::new(events_published_total.clone()))?;
        registry.register(Box::new(events_dropped_total.clone()))?;
        registry.register(Box::new(rtsp_reconnects_total.clone()))?;
        registry.register(Box::new(camera_state.clone()))?;
        registry.register(Box::new(ring_buffer_fill.clone()))?;
        registry.register(Box::new(frame_ingest_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            frames_ingested_total,
            decode_errors_total,
            motion_events_total,
            motion_frames_dropped_total,
            events_published_total,
            events_dropped_total,
            rtsp_reconnects_total,
            camera_state,
            ring_buffer_fill,
            frame_ingest_latency_seconds,
        })
    }

    /// Render the Prometheus text exposition format.
    pub fn gather(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| IngestError::Config(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| IngestError::Config(e.to_string()))
    }

    /// Drop the per-camera series when a camera is deregistered so the
    /// exposition does not accumulate dead label sets.
    pub fn remove_camera(&self, camera_id: &str) {
        let _ = self.decode_errors_total.remove_label_values(&[camera_id]);
        let _ = self.motion_events_total.remove_label_values(&[camera_id]);
        let _ = self
            .motion_frames_dropped_total
            .remove_label_values(&[camera_id]);
        let _ = self.rtsp_reconnects_total.remove_label_values(&[camera_id]);
        let _ = self.camera_state.remove_label_values(&[camera_id]);
        let _ = self.ring_buffer_fill.remove_label_values(&[camera_id]);
        for source in SOURCES {
            let _ = self
                .frames_ingested_total
                .remove_label_values(&[camera_id, source]);
        }
        for kind in EVENT_KINDS {
            let _ = self
                .events_published_total
                .remove_label_values(&[camera_id, kind]);
            let _ = self
                .events_dropped_total
                .remove_label_values(&[camera_id, kind]);
        }
    }
}

impl From<prometheus::Error> for IngestError {
    fn from(error: prometheus::Error) -> Self {
        IngestError::Config(error.to_string())
    }
}
