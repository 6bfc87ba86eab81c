use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::Result;
use crate::events::{channel_for, Event};
use crate::metrics::Metrics;
use crate::queue::DropOldestQueue;

pub mod redis_pub;

/// Time allowed to flush pending events after a camera is cancelled.
const DRAIN_DEADLINE: Duration = Duration::from_secs(1);
const DRAIN_SEND_TIMEOUT: Duration = Duration::from_millis(250);

/// Transport seam for the bus so tests can record instead of publish.
#[async_trait]
pub trait BusTransport: Send + Sync + 'static {
    async fn send(&self, channel: &str, payload: Vec<u8>) -> Result<()>;
}

/// Fan-out adapter for the external pub/sub bus.
///
/// `publish` is fire-and-forget: events land in a bounded per-camera queue
/// and a per-camera drain task delivers them, so bus slowness or outages can
/// drop events but never stall the ingest path. Per-camera ordering is
/// preserved by the single drain task.
pub struct EventBus {
    transport: Arc<dyn BusTransport>,
    queues: DashMap<String, Arc<DropOldestQueue<Event>>>,
    queue_capacity: usize,
    metrics: Arc<Metrics>,
}

impl EventBus {
    pub fn new(
        transport: Arc<dyn BusTransport>,
        queue_capacity: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            transport,
            queues: DashMap::new(),
            queue_capacity,
            metrics,
        }
    }

    /// Create the camera's pending-event queue and spawn its drain task on
    /// the camera's tracker.
    pub fn attach(&self, camera_id: &str, cancel: CancellationToken, tasks: &TaskTracker) {
        let queue = Arc::new(DropOldestQueue::new(self.queue_capacity));
        self.queues.insert(camera_id.to_string(), queue.clone());

        let transport = self.transport.clone();
        let metrics = self.metrics.clone();
        let camera_id = camera_id.to_string();
        tasks.spawn(async move {
            drain_loop(transport, queue, cancel, metrics, camera_id).await;
        });
    }

    /// Remove the camera's queue. Call after its drain task has stopped.
    pub fn detach(&self, camera_id: &str) {
        self.queues.remove(camera_id);
    }

    /// Enqueue an event for delivery. Returns immediately; on overflow the
    /// oldest pending event is dropped and counted.
    pub fn publish(&self, event: Event) {
        let camera_id = event.camera_id().to_string();
        let Some(queue) = self.queues.get(&camera_id) else {
            // Camera already detached; the event has nowhere to go.
            self.metrics
                .events_dropped_total
                .with_label_values(&[camera_id.as_str(), event.kind()])
                .inc();
            return;
        };
        if let Some(displaced) = queue.push(event) {
            warn!(camera_id, kind = displaced.kind(), "publish queue full, dropping oldest event");
            self.metrics
                .events_dropped_total
                .with_label_values(&[camera_id.as_str(), displaced.kind()])
                .inc();
        }
    }
}

async fn drain_loop(
    transport: Arc<dyn BusTransport>,
    queue: Arc<DropOldestQueue<Event>>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
    camera_id: String,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = queue.pop() => {
                deliver(&*transport, &metrics, &camera_id, event).await;
            }
        }
    }

    // Best-effort flush of whatever is still pending, bounded so camera
    // teardown stays within its acknowledgement window.
    let deadline = Instant::now() + DRAIN_DEADLINE;
    while let Some(event) = queue.try_pop() {
        if Instant::now() >= deadline {
            metrics
                .events_dropped_total
                .with_label_values(&[camera_id.as_str(), event.kind()])
                .inc();
            continue;
        }
        match tokio::time::timeout(DRAIN_SEND_TIMEOUT, deliver(&*transport, &metrics, &camera_id, event.clone())).await {
            Ok(()) => {}
            Err(_) => {
                metrics
                    .events_dropped_total
                    .with_label_values(&[camera_id.as_str(), event.kind()])
                    .inc();
            }
        }
    }
    debug!(camera_id, "event publisher stopped");
}

async fn deliver(transport: &dyn BusTransport, metrics: &Metrics, camera_id: &str, event: Event) {
    let kind = event.kind();
    let payload = match serde_json::to_vec(&event) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(camera_id, kind, error = %e, "failed to encode event");
            metrics
                .events_dropped_total
                .with_label_values(&[camera_id, kind])
                .inc();
            return;
        }
    };

    match transport.send(&channel_for(camera_id), payload).await {
        Ok(()) => {
            metrics
                .events_published_total
                .with_label_values(&[camera_id, kind])
                .inc();
        }
        Err(e) => {
            warn!(camera_id, kind, error = %e, "bus publish failed, dropping event");
            metrics
                .events_dropped_total
                .with_label_values(&[camera_id, kind])
                .inc();
        }
    }
}
