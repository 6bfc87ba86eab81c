//! Camera ingestion service.
//!
//! Attaches to a dynamic set of video sources (RTSP pull, HTTP push),
//! normalizes frames into per-camera ring buffers, runs a frame-differencing
//! motion stage, and fans lifecycle and frame events out to a Redis pub/sub
//! bus. An actix-web control plane drives the registry and reads from the
//! buffers; `/metrics` exposes Prometheus counters for the whole pipeline.

pub mod api;
pub mod buffer;
pub mod camera;
pub mod config;
pub mod error;
pub mod events;
pub mod frame;
pub mod messaging;
pub mod metrics;
pub mod queue;

use std::sync::Arc;

use camera::registry::CameraRegistry;
use camera::rtsp::default_session_factory;
use config::IngestConfig;
use error::Result;
use messaging::redis_pub::RedisTransport;
use messaging::EventBus;
use metrics::Metrics;

/// Process-wide state: the explicit objects constructed once at startup and
/// handed to every component. No ambient singletons.
#[derive(Clone)]
pub struct AppState {
    pub config: IngestConfig,
    pub registry: Arc<CameraRegistry>,
    pub metrics: Arc<Metrics>,
    pub bus: Arc<EventBus>,
}

impl AppState {
    pub fn new(config: IngestConfig) -> Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let transport = Arc::new(RedisTransport::new(&config.redis_url)?);
        let bus = Arc::new(EventBus::new(
            transport,
            config.publish_queue_size,
            metrics.clone(),
        ));
        let session_factory = default_session_factory()?;
        let registry = Arc::new(CameraRegistry::new(
            config.clone(),
            metrics.clone(),
            bus.clone(),
            session_factory,
        ));

        Ok(Self {
            config,
            registry,
            metrics,
            bus,
        })
    }
}
