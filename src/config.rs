use std::path::PathBuf;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// Process configuration, loaded from an optional file plus the environment
/// (`REDIS_URL`, `HTTP_BIND_ADDR`, `DEFAULT_BUFFER_SIZE`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Bus endpoint, e.g. `redis://localhost:6379`.
    pub redis_url: String,

    pub http_bind_addr: String,

    /// Ring capacity for cameras registered without an explicit buffer_size.
    pub default_buffer_size: usize,

    /// Per-channel absolute-difference threshold, 0-255 scale.
    pub motion_threshold: u8,

    /// Minimum changed-pixel count to emit motion. Unset means 0.5% of the
    /// frame's pixel count.
    pub motion_area_min: Option<u64>,

    pub motion_cooldown_seconds: f64,

    /// Capacity of the per-camera motion and publish queues.
    pub publish_queue_size: usize,

    pub log_level: String,

    /// When set, camera specs are persisted here and re-registered at startup.
    pub camera_db_file: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            http_bind_addr: "0.0.0.0:8080".to_string(),
            default_buffer_size: 100,
            motion_threshold: 25,
            motion_area_min: None,
            motion_cooldown_seconds: 2.0,
            publish_queue_size: 64,
            log_level: "info".to_string(),
            camera_db_file: None,
        }
    }
}

impl IngestConfig {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        let settings = builder
            .add_source(Environment::default().try_parsing(true))
            .build()
            .map_err(|e| IngestError::Config(e.to_string()))?;

        let config: IngestConfig = settings
            .try_deserialize()
            .map_err(|e| IngestError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(1..=1000).contains(&self.default_buffer_size) {
            return Err(IngestError::Config(format!(
                "default_buffer_size must be in 1..=1000, got {}",
                self.default_buffer_size
            )));
        }
        if self.publish_queue_size == 0 {
            return Err(IngestError::Config(
                "publish_queue_size must be at least 1".to_string(),
            ));
        }
        if self.motion_threshold == 0 {
            return Err(IngestError::Config(
                "motion_threshold must be in 1..=255".to_string(),
            ));
        }
        if !self.motion_cooldown_seconds.is_finite() || self.motion_cooldown_seconds < 0.0 {
            return Err(IngestError::Config(
                "motion_cooldown_seconds must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}
