use serde::{Deserialize, Serialize};

use crate::frame::SourceType;

/// Lifecycle and frame events fanned out on the pub/sub bus.
///
/// Serialized as compact JSON tagged with `type`, published on the
/// per-camera channel returned by [`channel_for`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "camera.connected")]
    CameraConnected { camera_id: String, timestamp: f64 },

    #[serde(rename = "camera.disconnected")]
    CameraDisconnected {
        camera_id: String,
        reason: String,
        timestamp: f64,
    },

    #[serde(rename = "frame.ingested")]
    FrameIngested {
        camera_id: String,
        timestamp: f64,
        source: SourceType,
        seq: u64,
    },

    #[serde(rename = "motion.detected")]
    MotionDetected {
        camera_id: String,
        timestamp: f64,
        area: u64,
    },
}

impl Event {
    /// Stable event-type tag, used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::CameraConnected { .. } => "camera.connected",
            Event::CameraDisconnected { .. } => "camera.disconnected",
            Event::FrameIngested { .. } => "frame.ingested",
            Event::MotionDetected { .. } => "motion.detected",
        }
    }

    pub fn camera_id(&self) -> &str {
        match self {
            Event::CameraConnected { camera_id, .. }
            | Event::CameraDisconnected { camera_id, .. }
            | Event::FrameIngested { camera_id, .. }
            | Event::MotionDetected { camera_id, .. } => camera_id,
        }
    }
}

/// Bus channel for one camera's events.
pub fn channel_for(camera_id: &str) -> String {
    format!("camera:{camera_id}")
}
