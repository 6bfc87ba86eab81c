//! GStreamer-backed RTSP sessions (`rtsp-gstreamer` feature).

use std::sync::Once;

use async_trait::async_trait;
use gstreamer::prelude::*;
use gstreamer::{self as gst, Pipeline};
use gstreamer_app::{AppSink, AppSinkCallbacks};
use gstreamer_video as gst_video;
use image::RgbImage;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::camera::rtsp::{RtspSession, RtspSessionFactory, SessionFrame};
use crate::error::{IngestError, Result};

static GST_INIT: Once = Once::new();

const CONNECT_TIMEOUT_SECS: u64 = 10;

enum SessionEvent {
    Frame {
        data: Vec<u8>,
        width: u32,
        height: u32,
    },
    Error(String),
    Eos,
}

pub struct GstSessionFactory;

impl GstSessionFactory {
    pub fn new() -> Result<Self> {
        let mut init_error = None;
        GST_INIT.call_once(|| {
            if let Err(e) = gst::init() {
                init_error = Some(e.to_string());
            }
        });
        if let Some(e) = init_error {
            return Err(IngestError::Config(format!("gstreamer init failed: {e}")));
        }
        Ok(Self)
    }
}

#[async_trait]
impl RtspSessionFactory for GstSessionFactory {
    async fn open(&self, url: &str) -> Result<Box<dyn RtspSession>> {
        let url = url.to_string();
        let (pipeline, events) = tokio::task::spawn_blocking(move || open_pipeline(&url))
            .await
            .map_err(|e| IngestError::Source(format!("pipeline task failed: {e}")))??;
        Ok(Box::new(GstSession {
            pipeline: Some(pipeline),
            events,
        }))
    }
}

/// Build and start `rtspsrc ! rtpjitterbuffer ! rtph264depay ! avdec_h264 !
/// videoconvert ! appsink` with RGB caps, handing samples to a bounded
/// channel the async side reads from.
fn open_pipeline(url: &str) -> Result<(Pipeline, mpsc::Receiver<SessionEvent>)> {
    let pipeline = Pipeline::new();
    let (tx, rx) = mpsc::channel::<SessionEvent>(8);

    let rtspsrc = gst::ElementFactory::make("rtspsrc")
        .property("location", url)
        .build()
        .map_err(|e| IngestError::Source(format!("failed to create rtspsrc: {e}")))?;
    let jitterbuffer = gst::ElementFactory::make("rtpjitterbuffer")
        .build()
        .map_err(|e| IngestError::Source(format!("failed to create rtpjitterbuffer: {e}")))?;
    let depay = gst::ElementFactory::make("rtph264depay")
        .property("wait-for-keyframe", true)
        .build()
        .map_err(|e| IngestError::Source(format!("failed to create rtph264depay: {e}")))?;
    let decoder = gst::ElementFactory::make("avdec_h264")
        .build()
        .map_err(|e| IngestError::Source(format!("failed to create avdec_h264: {e}")))?;
    let convert = gst::ElementFactory::make("videoconvert")
        .build()
        .map_err(|e| IngestError::Source(format!("failed to create videoconvert: {e}")))?;

    let frame_tx = tx.clone();
    let callbacks = AppSinkCallbacks::builder()
        .new_sample(move |sink| {
            let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
            let Some(buffer) = sample.buffer() else {
                return Err(gst::FlowError::Error);
            };
            let Some(caps) = sample.caps() else {
                return Err(gst::FlowError::Error);
            };
            let info =
                gst_video::VideoInfo::from_caps(caps).map_err(|_| gst::FlowError::Error)?;
            let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

            // Keep pace with the consumer; the ring buffer downstream only
            // wants recent frames anyway.
            let _ = frame_tx.try_send(SessionEvent::Frame {
                data: map.as_slice().to_vec(),
                width: info.width(),
                height: info.height(),
            });
            Ok(gst::FlowSuccess::Ok)
        })
        .build();

    let appsink: gst::Element = AppSink::builder()
        .name("ingest-sink")
        .sync(false)
        .max_buffers(4)
        .drop(true)
        .callbacks(callbacks)
        .caps(
            &gst::Caps::builder("video/x-raw")
                .field("format", "RGB")
                .build(),
        )
        .build()
        .upcast();

    pipeline
        .add_many([&rtspsrc, &jitterbuffer, &depay, &decoder, &convert, &appsink])
        .map_err(|e| IngestError::Source(e.to_string()))?;

    let jitterbuffer_clone = jitterbuffer.clone();
    rtspsrc.connect_pad_added(move |_, src_pad| {
        if let Some(sink_pad) = jitterbuffer_clone.static_pad("sink") {
            if !sink_pad.is_linked() {
                if let Err(e) = src_pad.link(&sink_pad) {
                    warn!(error = ?e, "failed to link rtspsrc pad");
                }
            }
        }
    });

    gst::Element::link_many([&jitterbuffer, &depay, &decoder, &convert, &appsink])
        .map_err(|e| IngestError::Source(e.to_string()))?;

    // Stream-level failures surface through the bus as session events.
    if let Some(bus) = pipeline.bus() {
        let bus_tx = tx;
        bus.set_sync_handler(move |_, msg| {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    let _ = bus_tx.try_send(SessionEvent::Error(err.error().to_string()));
                }
                gst::MessageView::Eos(..) => {
                    let _ = bus_tx.try_send(SessionEvent::Eos);
                }
                _ => {}
            }
            gst::BusSyncReply::Drop
        });
    }

    pipeline
        .set_state(gst::State::Playing)
        .map_err(|e| IngestError::Source(format!("failed to start pipeline: {e}")))?;

    let (result, _, _) = pipeline.state(gst::ClockTime::from_seconds(CONNECT_TIMEOUT_SECS));
    if let Err(e) = result {
        let _ = pipeline.set_state(gst::State::Null);
        return Err(IngestError::Source(format!("session open failed: {e}")));
    }

    info!(url, "rtsp pipeline playing");
    Ok((pipeline, rx))
}

struct GstSession {
    pipeline: Option<Pipeline>,
    events: mpsc::Receiver<SessionEvent>,
}

#[async_trait]
impl RtspSession for GstSession {
    async fn read_frame(&mut self) -> Result<SessionFrame> {
        match self.events.recv().await {
            None => Err(IngestError::Source("pipeline terminated".into())),
            Some(SessionEvent::Error(e)) => Err(IngestError::Source(e)),
            Some(SessionEvent::Eos) => Err(IngestError::Source("end of stream".into())),
            Some(SessionEvent::Frame {
                data,
                width,
                height,
            }) => match RgbImage::from_raw(width, height, data) {
                Some(image) => Ok(SessionFrame {
                    image,
                    timestamp: None,
                }),
                None => Err(IngestError::Decode(format!(
                    "buffer does not match {width}x{height} RGB"
                ))),
            },
        }
    }

    async fn close(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = tokio::task::spawn_blocking(move || {
                let _ = pipeline.set_state(gst::State::Null);
            })
            .await;
        }
    }
}
