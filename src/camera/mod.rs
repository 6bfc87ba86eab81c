use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::RgbImage;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::buffer::FrameRing;
use crate::error::{IngestError, Result};
use crate::events::Event;
use crate::frame::{unix_now, Frame, SourceType};
use crate::messaging::EventBus;
use crate::metrics::Metrics;
use crate::queue::DropOldestQueue;

#[cfg(feature = "rtsp-gstreamer")]
pub mod gst_session;
pub mod motion;
pub mod push;
pub mod registry;
pub mod rtsp;

/// Lifecycle state of a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraState {
    Registering,
    Connecting,
    Connected,
    Disconnected,
    Stopped,
}

impl CameraState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraState::Registering => "registering",
            CameraState::Connecting => "connecting",
            CameraState::Connected => "connected",
            CameraState::Disconnected => "disconnected",
            CameraState::Stopped => "stopped",
        }
    }

    /// Encoding used by the `camera_state` gauge.
    pub fn gauge_value(&self) -> i64 {
        match self {
            CameraState::Registering => 0,
            CameraState::Connecting => 1,
            CameraState::Connected => 2,
            CameraState::Disconnected => 3,
            CameraState::Stopped => 4,
        }
    }
}

/// Registration request for one camera; also the shape persisted to the
/// camera db file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSpec {
    pub id: String,
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_threshold: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_area_min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_cooldown_seconds: Option<f64>,
}

/// Per-camera motion tuning, resolved from the spec and process defaults.
#[derive(Debug, Clone)]
pub struct MotionSettings {
    /// Per-channel absolute-difference threshold, 0-255 scale.
    pub threshold: u8,
    /// Minimum changed-pixel count; unset means 0.5% of the frame's pixels.
    pub min_area: Option<u64>,
    pub cooldown_seconds: f64,
}

/// Summary row for `GET /api/cameras`.
#[derive(Debug, Serialize)]
pub struct CameraSummary {
    pub id: String,
    pub source_type: SourceType,
    pub state: CameraState,
    pub last_frame_at: Option<f64>,
    pub fill: usize,
}

/// One registered camera: its record, its ring buffer, and the handles for
/// its tasks. Owned exclusively by the registry.
#[derive(Debug)]
pub struct Camera {
    pub spec: CameraSpec,
    pub created_at: DateTime<Utc>,
    pub ring: Arc<FrameRing>,
    pub motion: MotionSettings,
    /// Cancels every task belonging to this camera.
    pub cancel: CancellationToken,
    pub tasks: TaskTracker,

    seq: AtomicU64,
    state: RwLock<CameraState>,
    last_frame_at: RwLock<Option<f64>>,
    consecutive_failures: AtomicU32,
    motion_queue: Arc<DropOldestQueue<Arc<Frame>>>,
    /// Serializes `ingest_frame` so sequence order and append order agree
    /// even when pushes arrive on several control-plane threads at once.
    ingest_lock: Mutex<()>,
}

impl Camera {
    pub fn new(spec: CameraSpec, ring_capacity: usize, motion: MotionSettings, queue_capacity: usize) -> Self {
        Self {
            spec,
            created_at: Utc::now(),
            ring: Arc::new(FrameRing::new(ring_capacity)),
            motion,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            seq: AtomicU64::new(0),
            state: RwLock::new(CameraState::Registering),
            last_frame_at: RwLock::new(None),
            consecutive_failures: AtomicU32::new(0),
            motion_queue: Arc::new(DropOldestQueue::new(queue_capacity)),
            ingest_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn source_type(&self) -> SourceType {
        self.spec.source_type
    }

    pub fn state(&self) -> CameraState {
        *self.state.read()
    }

    pub fn set_state(&self, state: CameraState, metrics: &Metrics) {
        *self.state.write() = state;
        metrics
            .camera_state
            .with_label_values(&[self.id()])
            .set(state.gauge_value());
        debug!(camera_id = self.id(), state = state.as_str(), "camera state changed");
    }

    pub fn last_frame_at(&self) -> Option<f64> {
        *self.last_frame_at.read()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn record_connect_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn motion_queue(&self) -> Arc<DropOldestQueue<Arc<Frame>>> {
        self.motion_queue.clone()
    }

    /// The per-frame ingest path shared by the RTSP worker and the push
    /// sink: assign a sequence number, append to the ring, hand off to the
    /// motion stage without blocking, and enqueue the `frame.ingested`
    /// event. Returns the assigned sequence number.
    ///
    /// Serialized per camera: an RTSP camera has a single worker task, but
    /// push cameras take frames from whichever control-plane thread handles
    /// the request, and ring order must follow sequence order.
    pub fn ingest_frame(
        &self,
        image: RgbImage,
        timestamp: f64,
        metrics: &Metrics,
        bus: &EventBus,
    ) -> u64 {
        // Never held across an await; nothing below suspends.
        let _ingest = self.ingest_lock.lock();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let source = self.source_type();
        let frame = Arc::new(Frame {
            image,
            timestamp,
            source,
            seq,
        });

        self.ring.append(frame.clone());
        *self.last_frame_at.write() = Some(timestamp);

        metrics
            .ring_buffer_fill
            .with_label_values(&[self.id()])
            .set(self.ring.len() as i64);
        metrics
            .frames_ingested_total
            .with_label_values(&[self.id(), source.as_str()])
            .inc();
        metrics
            .frame_ingest_latency_seconds
            .observe((unix_now() - timestamp).max(0.0));

        if self.motion_queue.push(frame).is_some() {
            metrics
                .motion_frames_dropped_total
                .with_label_values(&[self.id()])
                .inc();
        }

        bus.publish(Event::FrameIngested {
            camera_id: self.id().to_string(),
            timestamp,
            source,
            seq,
        });

        seq
    }

    pub fn summary(&self) -> CameraSummary {
        CameraSummary {
            id: self.id().to_string(),
            source_type: self.source_type(),
            state: self.state(),
            last_frame_at: self.last_frame_at(),
            fill: self.ring.len(),
        }
    }

    /// Reject specs the registry must not accept.
    pub fn validate_spec(spec: &CameraSpec) -> Result<()> {
        if spec.id.trim().is_empty() {
            return Err(IngestError::Validation("camera id must be non-empty".into()));
        }
        if let Some(size) = spec.buffer_size {
            if !(1..=1000).contains(&size) {
                return Err(IngestError::Validation(format!(
                    "buffer_size must be in 1..=1000, got {size}"
                )));
            }
        }
        if let Some(threshold) = spec.motion_threshold {
            if threshold == 0 {
                return Err(IngestError::Validation(
                    "motion_threshold must be in 1..=255".into(),
                ));
            }
        }
        if let Some(cooldown) = spec.motion_cooldown_seconds {
            if !cooldown.is_finite() || cooldown < 0.0 {
                return Err(IngestError::Validation(
                    "motion_cooldown_seconds must be non-negative".into(),
                ));
            }
        }
        match spec.source_type {
            SourceType::Rtsp => {
                let Some(url) = spec.source_url.as_deref() else {
                    return Err(IngestError::Validation(
                        "source_type 'rtsp' requires a source_url".into(),
                    ));
                };
                let parsed = url::Url::parse(url)
                    .map_err(|e| IngestError::Validation(format!("invalid source_url: {e}")))?;
                if !matches!(parsed.scheme(), "rtsp" | "rtsps") {
                    return Err(IngestError::Validation(format!(
                        "source_url must be an rtsp:// url, got scheme '{}'",
                        parsed.scheme()
                    )));
                }
            }
            SourceType::HttpPush => {}
        }
        Ok(())
    }
}
