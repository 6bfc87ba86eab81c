use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::camera::motion::spawn_motion_stage;
use crate::camera::rtsp::{RtspSessionFactory, RtspWorker};
use crate::camera::{Camera, CameraSpec, CameraState, CameraSummary, MotionSettings};
use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::events::Event;
use crate::frame::{unix_now, Frame, SourceType};
use crate::messaging::EventBus;
use crate::metrics::Metrics;

/// How long camera tasks get to acknowledge cancellation before their
/// resources are released anyway.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Sole owner of all camera records and worker handles.
///
/// Mutations (register/deregister) serialize through one async mutex so
/// concurrent operations on the same id are well-defined; reads go through
/// the shared table concurrently.
pub struct CameraRegistry {
    cameras: DashMap<String, Arc<Camera>>,
    mutation: Mutex<()>,
    config: IngestConfig,
    metrics: Arc<Metrics>,
    bus: Arc<EventBus>,
    session_factory: Arc<dyn RtspSessionFactory>,
}

impl CameraRegistry {
    pub fn new(
        config: IngestConfig,
        metrics: Arc<Metrics>,
        bus: Arc<EventBus>,
        session_factory: Arc<dyn RtspSessionFactory>,
    ) -> Self {
        Self {
            cameras: DashMap::new(),
            mutation: Mutex::new(()),
            config,
            metrics,
            bus,
            session_factory,
        }
    }

    /// Create the camera, its ring buffer, and its tasks. Returns promptly
    /// without waiting for an RTSP source to connect.
    pub async fn register(&self, spec: CameraSpec) -> Result<Arc<Camera>> {
        Camera::validate_spec(&spec)?;

        let _guard = self.mutation.lock().await;
        if self.cameras.contains_key(&spec.id) {
            return Err(IngestError::Conflict(spec.id));
        }

        let ring_capacity = spec.buffer_size.unwrap_or(self.config.default_buffer_size);
        let motion = MotionSettings {
            threshold: spec.motion_threshold.unwrap_or(self.config.motion_threshold),
            min_area: spec.motion_area_min.or(self.config.motion_area_min),
            cooldown_seconds: spec
                .motion_cooldown_seconds
                .unwrap_or(self.config.motion_cooldown_seconds),
        };
        let camera = Arc::new(Camera::new(
            spec,
            ring_capacity,
            motion,
            self.config.publish_queue_size,
        ));
        camera.set_state(CameraState::Registering, &self.metrics);

        self.bus
            .attach(camera.id(), camera.cancel.clone(), &camera.tasks);
        spawn_motion_stage(&camera, self.metrics.clone(), self.bus.clone());

        match camera.source_type() {
            SourceType::Rtsp => {
                RtspWorker::spawn(
                    camera.clone(),
                    self.session_factory.clone(),
                    self.metrics.clone(),
                    self.bus.clone(),
                );
            }
            SourceType::HttpPush => {
                // Push cameras have no session to open: their epoch starts
                // at creation.
                camera.set_state(CameraState::Connected, &self.metrics);
                self.bus.publish(Event::CameraConnected {
                    camera_id: camera.id().to_string(),
                    timestamp: unix_now(),
                });
            }
        }

        self.cameras
            .insert(camera.id().to_string(), camera.clone());
        info!(
            camera_id = camera.id(),
            source_type = camera.source_type().as_str(),
            ring_capacity,
            "camera registered"
        );
        self.persist().await;
        Ok(camera)
    }

    /// Stop the camera's tasks, drain what can be drained within the stop
    /// window, and remove every trace of the camera.
    pub async fn deregister(&self, camera_id: &str) -> Result<()> {
        let _guard = self.mutation.lock().await;
        let (_, camera) = self
            .cameras
            .remove(camera_id)
            .ok_or_else(|| IngestError::NotFound(camera_id.to_string()))?;

        self.stop_camera(&camera).await;
        self.bus.detach(camera_id);
        self.metrics.remove_camera(camera_id);
        info!(camera_id, "camera deregistered");
        self.persist().await;
        Ok(())
    }

    pub fn get(&self, camera_id: &str) -> Option<Arc<Camera>> {
        self.cameras.get(camera_id).map(|c| c.value().clone())
    }

    pub fn list(&self) -> Vec<CameraSummary> {
        let mut summaries: Vec<CameraSummary> =
            self.cameras.iter().map(|c| c.value().summary()).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn latest_frame(&self, camera_id: &str) -> Result<Arc<Frame>> {
        let camera = self
            .get(camera_id)
            .ok_or_else(|| IngestError::NotFound(camera_id.to_string()))?;
        camera.ring.latest().ok_or(IngestError::NoFrameYet)
    }

    /// Stop all camera tasks without touching the persisted registry; used
    /// at process shutdown.
    pub async fn shutdown(&self) {
        let cameras: Vec<Arc<Camera>> =
            self.cameras.iter().map(|c| c.value().clone()).collect();
        for camera in cameras {
            self.stop_camera(&camera).await;
        }
    }

    async fn stop_camera(&self, camera: &Arc<Camera>) {
        camera.cancel.cancel();
        camera.tasks.close();
        if tokio::time::timeout(STOP_TIMEOUT, camera.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                camera_id = camera.id(),
                "camera tasks did not stop within {STOP_TIMEOUT:?}, releasing anyway"
            );
        }
        camera.set_state(CameraState::Stopped, &self.metrics);
    }

    /// Re-register cameras saved by a previous run. Individual failures are
    /// logged and skipped.
    pub async fn load_persisted(&self) {
        let Some(path) = self.config.camera_db_file.clone() else {
            return;
        };
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no camera db file, starting empty");
                return;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read camera db file");
                return;
            }
        };
        let specs: Vec<CameraSpec> = match serde_json::from_slice(&data) {
            Ok(specs) => specs,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse camera db file");
                return;
            }
        };
        info!(count = specs.len(), "restoring cameras from db file");
        for spec in specs {
            let camera_id = spec.id.clone();
            if let Err(e) = self.register(spec).await {
                warn!(camera_id, error = %e, "failed to restore camera");
            }
        }
    }

    async fn persist(&self) {
        let Some(path) = self.config.camera_db_file.clone() else {
            return;
        };
        let mut specs: Vec<CameraSpec> =
            self.cameras.iter().map(|c| c.value().spec.clone()).collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        match serde_json::to_vec_pretty(&specs) {
            Ok(data) => {
                if let Err(e) = tokio::fs::write(&path, data).await {
                    warn!(path = %path.display(), error = %e, "failed to persist camera db");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode camera db"),
        }
    }
}
