use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::camera::{Camera, CameraState};
use crate::error::{IngestError, Result};
use crate::events::Event;
use crate::frame::unix_now;
use crate::messaging::EventBus;
use crate::metrics::Metrics;

/// Bound on a single in-session read.
const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// This many decode failures in a row force a reconnect.
const MAX_CONSECUTIVE_DECODE_FAILURES: u32 = 10;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// One decoded frame read from a session, with the source timestamp when the
/// stream provides one.
pub struct SessionFrame {
    pub image: RgbImage,
    pub timestamp: Option<f64>,
}

/// An open RTSP session. `read_frame` distinguishes single-packet decode
/// failures (`IngestError::Decode`, the worker drops the packet) from
/// stream-level failures (`IngestError::Source`, the worker reconnects).
#[async_trait]
pub trait RtspSession: Send {
    async fn read_frame(&mut self) -> Result<SessionFrame>;
    async fn close(&mut self);
}

/// Produces sessions for the worker. Injected so tests drive the state
/// machine with scripted sessions instead of a live stream.
#[async_trait]
pub trait RtspSessionFactory: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Box<dyn RtspSession>>;
}

/// Factory used when the crate is built without an RTSP backend: every
/// connect attempt fails and the worker follows its normal backoff path.
pub struct UnsupportedSessionFactory;

#[async_trait]
impl RtspSessionFactory for UnsupportedSessionFactory {
    async fn open(&self, _url: &str) -> Result<Box<dyn RtspSession>> {
        Err(IngestError::Source(
            "rtsp support not compiled in (enable the rtsp-gstreamer feature)".into(),
        ))
    }
}

/// The session factory for this build.
pub fn default_session_factory() -> Result<Arc<dyn RtspSessionFactory>> {
    #[cfg(feature = "rtsp-gstreamer")]
    {
        Ok(Arc::new(crate::camera::gst_session::GstSessionFactory::new()?))
    }
    #[cfg(not(feature = "rtsp-gstreamer"))]
    {
        Ok(Arc::new(UnsupportedSessionFactory))
    }
}

/// Exponential reconnect delays with full jitter: each delay is drawn
/// uniformly from `[0, ceiling]`, and the ceiling doubles up to the cap.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    ceiling: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            ceiling: base,
        }
    }

    /// Current upper bound on the next delay.
    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling;
        self.ceiling = std::cmp::min(self.cap, ceiling * 2);
        let secs = rand::thread_rng().gen_range(0.0..=ceiling.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    pub fn reset(&mut self) {
        self.ceiling = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_BASE, BACKOFF_CAP)
    }
}

enum PumpExit {
    Cancelled,
    Failed(String),
}

/// Owns the session lifecycle for one RTSP camera: connect with backoff,
/// pump frames while connected, emit lifecycle events on the transitions.
pub struct RtspWorker {
    camera: Arc<Camera>,
    factory: Arc<dyn RtspSessionFactory>,
    metrics: Arc<Metrics>,
    bus: Arc<EventBus>,
}

impl RtspWorker {
    pub fn spawn(
        camera: Arc<Camera>,
        factory: Arc<dyn RtspSessionFactory>,
        metrics: Arc<Metrics>,
        bus: Arc<EventBus>,
    ) {
        let tasks = camera.tasks.clone();
        let worker = Self {
            camera,
            factory,
            metrics,
            bus,
        };
        tasks.spawn(worker.run());
    }

    async fn run(self) {
        let url = self.camera.spec.source_url.clone().unwrap_or_default();
        let cancel = self.camera.cancel.clone();
        let mut backoff = Backoff::default();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.camera.set_state(CameraState::Connecting, &self.metrics);

            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.factory.open(&url) => result,
            };

            match opened {
                Err(e) => {
                    let failures = self.camera.record_connect_failure();
                    warn!(
                        camera_id = self.camera.id(),
                        error = %e,
                        consecutive_failures = failures,
                        "rtsp connect failed"
                    );
                    self.on_disconnected(e.to_string());
                    if !self.sleep_backoff(&mut backoff, &cancel).await {
                        break;
                    }
                }
                Ok(mut session) => {
                    backoff.reset();
                    self.camera.reset_failures();
                    self.camera.set_state(CameraState::Connected, &self.metrics);
                    self.bus.publish(Event::CameraConnected {
                        camera_id: self.camera.id().to_string(),
                        timestamp: unix_now(),
                    });
                    info!(camera_id = self.camera.id(), url, "rtsp session connected");

                    let exit = self.pump(session.as_mut(), &cancel).await;
                    session.close().await;

                    match exit {
                        PumpExit::Cancelled => break,
                        PumpExit::Failed(reason) => {
                            self.camera.record_connect_failure();
                            self.on_disconnected(reason);
                            if !self.sleep_backoff(&mut backoff, &cancel).await {
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!(camera_id = self.camera.id(), "rtsp worker stopped");
    }

    /// Read frames until the stream fails, decode failures pile up, or the
    /// camera is cancelled.
    async fn pump(&self, session: &mut dyn RtspSession, cancel: &CancellationToken) -> PumpExit {
        let mut decode_failures = 0u32;
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return PumpExit::Cancelled,
                result = tokio::time::timeout(READ_TIMEOUT, session.read_frame()) => result,
            };

            match read {
                Err(_) => return PumpExit::Failed("read timeout".into()),
                Ok(Err(IngestError::Decode(e))) => {
                    decode_failures += 1;
                    self.metrics
                        .decode_errors_total
                        .with_label_values(&[self.camera.id()])
                        .inc();
                    warn!(
                        camera_id = self.camera.id(),
                        error = %e,
                        consecutive = decode_failures,
                        "dropping undecodable packet"
                    );
                    if decode_failures >= MAX_CONSECUTIVE_DECODE_FAILURES {
                        return PumpExit::Failed(format!(
                            "{decode_failures} consecutive decode failures"
                        ));
                    }
                }
                Ok(Err(e)) => return PumpExit::Failed(e.to_string()),
                Ok(Ok(frame)) => {
                    decode_failures = 0;
                    let timestamp = frame.timestamp.unwrap_or_else(unix_now);
                    self.camera
                        .ingest_frame(frame.image, timestamp, &self.metrics, &self.bus);
                }
            }
        }
    }

    fn on_disconnected(&self, reason: String) {
        self.camera
            .set_state(CameraState::Disconnected, &self.metrics);
        self.metrics
            .rtsp_reconnects_total
            .with_label_values(&[self.camera.id()])
            .inc();
        self.bus.publish(Event::CameraDisconnected {
            camera_id: self.camera.id().to_string(),
            reason,
            timestamp: unix_now(),
        });
    }

    /// Returns false when cancelled during the wait.
    async fn sleep_backoff(&self, backoff: &mut Backoff, cancel: &CancellationToken) -> bool {
        let delay = backoff.next_delay();
        debug!(
            camera_id = self.camera.id(),
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraSpec, MotionSettings};
    use crate::frame::SourceType;
    use crate::messaging::testing::RecordingTransport;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn rtsp_camera(id: &str) -> Arc<Camera> {
        Arc::new(Camera::new(
            CameraSpec {
                id: id.to_string(),
                source_type: SourceType::Rtsp,
                source_url: Some("rtsp://camera.local/stream".into()),
                buffer_size: None,
                motion_threshold: None,
                motion_area_min: None,
                motion_cooldown_seconds: None,
            },
            10,
            MotionSettings {
                threshold: 25,
                min_area: None,
                cooldown_seconds: 2.0,
            },
            16,
        ))
    }

    struct TestHarness {
        metrics: Arc<Metrics>,
        bus: Arc<EventBus>,
        transport: Arc<RecordingTransport>,
    }

    impl TestHarness {
        fn new() -> Self {
            let metrics = Arc::new(Metrics::new().unwrap());
            let transport = RecordingTransport::new();
            let bus = Arc::new(EventBus::new(transport.clone(), 64, metrics.clone()));
            Self {
                metrics,
                bus,
                transport,
            }
        }

        fn start(&self, camera: &Arc<Camera>, factory: Arc<dyn RtspSessionFactory>) {
            self.bus
                .attach(camera.id(), camera.cancel.clone(), &camera.tasks);
            RtspWorker::spawn(camera.clone(), factory, self.metrics.clone(), self.bus.clone());
        }
    }

    enum FakeRead {
        Frame(u8),
        DecodeError,
        SourceError(&'static str),
        Hang,
    }

    struct FakeSession {
        reads: Arc<Mutex<VecDeque<FakeRead>>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RtspSession for FakeSession {
        async fn read_frame(&mut self) -> Result<SessionFrame> {
            let read = self.reads.lock().unwrap().pop_front();
            match read {
                None => Err(IngestError::Source("stream ended".into())),
                Some(FakeRead::SourceError(reason)) => Err(IngestError::Source(reason.into())),
                Some(FakeRead::DecodeError) => Err(IngestError::Decode("bad packet".into())),
                Some(FakeRead::Frame(value)) => Ok(SessionFrame {
                    image: RgbImage::from_pixel(8, 8, image::Rgb([value, value, value])),
                    timestamp: None,
                }),
                Some(FakeRead::Hang) => {
                    futures_util::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Scripted factory: one entry per connect attempt; exhausted script
    /// means the source is unreachable.
    struct FakeFactory {
        sessions: Mutex<VecDeque<FakeSession>>,
        opens: AtomicUsize,
    }

    impl FakeFactory {
        fn new(sessions: Vec<FakeSession>) -> Arc<Self> {
            Arc::new(Self {
                sessions: Mutex::new(sessions.into()),
                opens: AtomicUsize::new(0),
            })
        }

        fn session(reads: Vec<FakeRead>) -> (FakeSession, Arc<AtomicBool>) {
            let closed = Arc::new(AtomicBool::new(false));
            (
                FakeSession {
                    reads: Arc::new(Mutex::new(reads.into())),
                    closed: closed.clone(),
                },
                closed,
            )
        }
    }

    #[async_trait]
    impl RtspSessionFactory for FakeFactory {
        async fn open(&self, _url: &str) -> Result<Box<dyn RtspSession>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match self.sessions.lock().unwrap().pop_front() {
                Some(session) => Ok(Box::new(session)),
                None => Err(IngestError::Source("connection refused".into())),
            }
        }
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(60), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[test]
    fn backoff_doubles_to_cap_with_full_jitter() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));

        let expected_ceilings = [1u64, 2, 4, 8, 16, 30, 30];
        for expected in expected_ceilings {
            let ceiling = backoff.ceiling();
            assert_eq!(ceiling, Duration::from_secs(expected));
            let delay = backoff.next_delay();
            assert!(delay <= ceiling, "{delay:?} exceeds {ceiling:?}");
        }

        backoff.reset();
        assert_eq!(backoff.ceiling(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn connected_session_ingests_frames_in_seq_order() {
        let harness = TestHarness::new();
        let camera = rtsp_camera("cam_rtsp_1");

        let (session, _) = FakeFactory::session(vec![
            FakeRead::Frame(10),
            FakeRead::Frame(20),
            FakeRead::Frame(30),
            FakeRead::SourceError("stream closed"),
        ]);
        let factory = FakeFactory::new(vec![session]);
        harness.start(&camera, factory);

        let ring = camera.ring.clone();
        wait_for(|| ring.len() == 3).await;

        let seqs: Vec<u64> = camera.ring.snapshot(3).iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        // Epoch bracketing: connected first, then the frames, then the
        // disconnect for this epoch.
        let transport = harness.transport.clone();
        wait_for(|| {
            transport
                .events()
                .iter()
                .any(|e| matches!(e, Event::CameraDisconnected { .. }))
        })
        .await;

        let kinds: Vec<&'static str> = harness.transport.events().iter().map(Event::kind).collect();
        let connected_at = kinds.iter().position(|k| *k == "camera.connected").unwrap();
        let disconnected_at = kinds
            .iter()
            .position(|k| *k == "camera.disconnected")
            .unwrap();
        let frame_positions: Vec<usize> = kinds
            .iter()
            .enumerate()
            .filter(|(_, k)| **k == "frame.ingested")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(frame_positions.len(), 3);
        assert!(frame_positions.iter().all(|p| *p > connected_at));
        assert!(frame_positions.iter().all(|p| *p < disconnected_at));

        camera.cancel.cancel();
        camera.tasks.close();
        camera.tasks.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_source_keeps_reconnecting() {
        let harness = TestHarness::new();
        let camera = rtsp_camera("cam_rtsp_2");
        let factory = FakeFactory::new(vec![]);
        harness.start(&camera, factory.clone());

        let reconnects = harness
            .metrics
            .rtsp_reconnects_total
            .with_label_values(&["cam_rtsp_2"]);
        wait_for(|| reconnects.get() >= 3).await;
        wait_for(|| camera.state() == CameraState::Disconnected).await;

        assert!(camera.consecutive_failures() >= 3);
        assert!(factory.opens.load(Ordering::SeqCst) >= 3);

        camera.cancel.cancel();
        camera.tasks.close();
        camera.tasks.wait().await;

        let disconnects = harness
            .transport
            .events()
            .iter()
            .filter(|e| matches!(e, Event::CameraDisconnected { .. }))
            .count();
        assert!(disconnects >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn ten_consecutive_decode_failures_force_reconnect() {
        let harness = TestHarness::new();
        let camera = rtsp_camera("cam_rtsp_3");

        let mut reads: Vec<FakeRead> = (0..10).map(|_| FakeRead::DecodeError).collect();
        // Anything after the tenth failure must never be read.
        reads.push(FakeRead::Frame(99));
        let (first, _) = FakeFactory::session(reads);
        let leftover = first.reads.clone();

        let (second, _) = FakeFactory::session(vec![
            FakeRead::Frame(1),
            FakeRead::SourceError("stream closed"),
        ]);
        let factory = FakeFactory::new(vec![first, second]);
        harness.start(&camera, factory);

        let ring = camera.ring.clone();
        wait_for(|| ring.len() == 1).await;

        assert_eq!(
            harness
                .metrics
                .decode_errors_total
                .with_label_values(&["cam_rtsp_3"])
                .get(),
            10
        );
        assert_eq!(leftover.lock().unwrap().len(), 1, "frame after failure cap was read");
        // The decode-failed packets were dropped: the first real frame is seq 0.
        assert_eq!(camera.ring.latest().unwrap().seq, 0);

        camera.cancel.cancel();
        camera.tasks.close();
        camera.tasks.wait().await;

        assert!(harness.transport.events().iter().any(|e| matches!(
            e,
            Event::CameraDisconnected { reason, .. } if reason.contains("decode")
        )));
    }

    #[tokio::test]
    async fn stop_is_honored_promptly_and_closes_the_session() {
        let harness = TestHarness::new();
        let camera = rtsp_camera("cam_rtsp_4");

        let (session, closed) =
            FakeFactory::session(vec![FakeRead::Frame(5), FakeRead::Hang]);
        let factory = FakeFactory::new(vec![session]);
        harness.start(&camera, factory);

        let ring = camera.ring.clone();
        tokio::time::timeout(Duration::from_secs(2), async {
            while ring.len() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        camera.cancel.cancel();
        camera.tasks.close();
        tokio::time::timeout(Duration::from_secs(2), camera.tasks.wait())
            .await
            .expect("worker did not stop within the cancellation window");
        assert!(closed.load(Ordering::SeqCst));
    }
}
