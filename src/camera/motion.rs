use std::sync::Arc;

use image::GrayImage;
use tracing::debug;

use crate::camera::{Camera, MotionSettings};
use crate::events::Event;
use crate::frame::Frame;
use crate::messaging::EventBus;
use crate::metrics::Metrics;

/// Fraction of the frame's pixels used as the changed-area floor when no
/// explicit minimum is configured.
const DEFAULT_MIN_AREA_FRACTION: f64 = 0.005;

/// Grayscale frame-differencing detector.
///
/// Holds the previous-frame reference and the last emission time privately;
/// nothing else reaches into this state. Deliberately simple: it exists to
/// exercise the pipeline, not to be a production-grade analyzer.
pub struct MotionDetector {
    settings: MotionSettings,
    previous: Option<GrayImage>,
    last_emit_ts: Option<f64>,
}

impl MotionDetector {
    pub fn new(settings: MotionSettings) -> Self {
        Self {
            settings,
            previous: None,
            last_emit_ts: None,
        }
    }

    /// Process one frame; returns the changed-pixel area when motion should
    /// be reported. The reference is always updated.
    pub fn process(&mut self, frame: &Frame) -> Option<u64> {
        let gray = image::imageops::grayscale(&frame.image);

        let Some(previous) = self.previous.take() else {
            self.previous = Some(gray);
            return None;
        };

        // A resolution change (e.g. after a reconnect) invalidates the
        // reference; store the new one and report nothing for this frame.
        if previous.dimensions() != gray.dimensions() {
            self.previous = Some(gray);
            return None;
        }

        let threshold = self.settings.threshold;
        let area = previous
            .as_raw()
            .iter()
            .zip(gray.as_raw().iter())
            .filter(|(a, b)| a.abs_diff(**b) >= threshold)
            .count() as u64;

        let pixel_count = (gray.width() as u64) * (gray.height() as u64);
        self.previous = Some(gray);

        let min_area = self
            .settings
            .min_area
            .unwrap_or_else(|| ((pixel_count as f64) * DEFAULT_MIN_AREA_FRACTION).ceil() as u64);

        if area >= min_area && self.cooldown_elapsed(frame.timestamp) {
            self.last_emit_ts = Some(frame.timestamp);
            return Some(area);
        }
        None
    }

    fn cooldown_elapsed(&self, timestamp: f64) -> bool {
        match self.last_emit_ts {
            None => true,
            Some(last) => timestamp - last >= self.settings.cooldown_seconds,
        }
    }
}

/// Spawn the camera's motion task: one consumer on the camera's bounded
/// motion queue, so a slow detector drops frames from this stage only.
pub fn spawn_motion_stage(camera: &Arc<Camera>, metrics: Arc<Metrics>, bus: Arc<EventBus>) {
    let queue = camera.motion_queue();
    let cancel = camera.cancel.clone();
    let camera_id = camera.id().to_string();
    let mut detector = MotionDetector::new(camera.motion.clone());

    camera.tasks.spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = queue.pop() => {
                    if let Some(area) = detector.process(&frame) {
                        metrics
                            .motion_events_total
                            .with_label_values(&[camera_id.as_str()])
                            .inc();
                        bus.publish(Event::MotionDetected {
                            camera_id: camera_id.clone(),
                            timestamp: frame.timestamp,
                            area,
                        });
                    }
                }
            }
        }
        debug!(camera_id, "motion stage stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraSpec, MotionSettings};
    use crate::frame::SourceType;
    use crate::messaging::testing::RecordingTransport;
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    fn settings(min_area: Option<u64>, cooldown: f64) -> MotionSettings {
        MotionSettings {
            threshold: 25,
            min_area,
            cooldown_seconds: cooldown,
        }
    }

    fn frame(image: RgbImage, timestamp: f64) -> Frame {
        Frame {
            image,
            timestamp,
            source: SourceType::HttpPush,
            seq: 0,
        }
    }

    fn solid(width: u32, height: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([value, value, value]))
    }

    #[test]
    fn first_frame_only_stores_reference() {
        let mut detector = MotionDetector::new(settings(None, 0.0));
        assert_eq!(detector.process(&frame(solid(10, 10, 255), 0.0)), None);
    }

    #[test]
    fn identical_frames_emit_nothing() {
        let mut detector = MotionDetector::new(settings(None, 0.0));
        detector.process(&frame(solid(10, 10, 40), 0.0));
        assert_eq!(detector.process(&frame(solid(10, 10, 40), 1.0)), None);
    }

    #[test]
    fn change_below_threshold_is_not_motion() {
        let mut detector = MotionDetector::new(settings(Some(1), 0.0));
        detector.process(&frame(solid(10, 10, 10), 0.0));
        // Per-pixel delta of 20 stays under the threshold of 25.
        assert_eq!(detector.process(&frame(solid(10, 10, 30), 1.0)), None);
    }

    #[test]
    fn area_equals_changed_pixel_count() {
        let mut detector = MotionDetector::new(settings(None, 0.0));
        detector.process(&frame(solid(100, 100, 0), 0.0));
        assert_eq!(detector.process(&frame(solid(100, 100, 0), 1.0)), None);

        // Flip 60 pixels to white: above the default floor of 0.5% (50).
        let mut changed = solid(100, 100, 0);
        for x in 0..60 {
            changed.put_pixel(x, 0, Rgb([255, 255, 255]));
        }
        assert_eq!(detector.process(&frame(changed, 2.0)), Some(60));
    }

    #[test]
    fn area_under_min_area_is_ignored() {
        let mut detector = MotionDetector::new(settings(Some(100), 0.0));
        detector.process(&frame(solid(100, 100, 0), 0.0));

        let mut changed = solid(100, 100, 0);
        for x in 0..99 {
            changed.put_pixel(x, 0, Rgb([255, 255, 255]));
        }
        assert_eq!(detector.process(&frame(changed, 1.0)), None);
    }

    #[test]
    fn cooldown_spaces_emissions() {
        let mut detector = MotionDetector::new(settings(Some(1), 2.0));
        // Alternate black/white so every processed frame is full-area motion.
        detector.process(&frame(solid(10, 10, 0), 0.0));
        assert!(detector.process(&frame(solid(10, 10, 255), 1.0)).is_some());
        assert_eq!(detector.process(&frame(solid(10, 10, 0), 2.0)), None);
        assert_eq!(detector.process(&frame(solid(10, 10, 255), 2.9)), None);
        assert!(detector.process(&frame(solid(10, 10, 0), 3.0)).is_some());
    }

    #[test]
    fn dimension_change_resets_reference() {
        let mut detector = MotionDetector::new(settings(Some(1), 0.0));
        detector.process(&frame(solid(10, 10, 0), 0.0));
        // Resolution change: no report, new reference stored.
        assert_eq!(detector.process(&frame(solid(20, 20, 255), 1.0)), None);
        // Next same-size frame diffs against the new reference.
        assert!(detector.process(&frame(solid(20, 20, 0), 2.0)).is_some());
    }

    #[tokio::test]
    async fn stage_publishes_motion_events() {
        let metrics = Arc::new(crate::metrics::Metrics::new().unwrap());
        let transport = RecordingTransport::new();
        let bus = Arc::new(EventBus::new(transport.clone(), 16, metrics.clone()));

        let camera = Arc::new(Camera::new(
            CameraSpec {
                id: "cam_motion".into(),
                source_type: SourceType::HttpPush,
                source_url: None,
                buffer_size: None,
                motion_threshold: None,
                motion_area_min: Some(1),
                motion_cooldown_seconds: Some(0.0),
            },
            10,
            settings(Some(1), 0.0),
            16,
        ));
        bus.attach(camera.id(), camera.cancel.clone(), &camera.tasks);
        spawn_motion_stage(&camera, metrics.clone(), bus.clone());

        let queue = camera.motion_queue();
        queue.push(Arc::new(frame(solid(10, 10, 0), 0.0)));
        queue.push(Arc::new(frame(solid(10, 10, 255), 1.0)));

        let counter = metrics
            .motion_events_total
            .with_label_values(&["cam_motion"]);
        tokio::time::timeout(Duration::from_secs(2), async {
            while counter.get() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("motion event not observed");

        camera.cancel.cancel();
        camera.tasks.close();
        camera.tasks.wait().await;

        let events = transport.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::MotionDetected { area: 100, .. })));
    }
}
