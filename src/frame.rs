use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

use image::{DynamicImage, ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// Kind of video source a frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Rtsp,
    HttpPush,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Rtsp => "rtsp",
            SourceType::HttpPush => "http_push",
        }
    }
}

/// One decoded frame with its capture metadata.
///
/// Frames are handed to readers as `Arc<Frame>`; the pixel data is never
/// aliased mutably once the frame is in a ring buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Capture time in seconds since the Unix epoch.
    pub timestamp: f64,
    pub source: SourceType,
    /// Per-camera sequence number, strictly increasing from 0.
    pub seq: u64,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Encode the frame as JPEG for the control plane.
    pub fn encode_jpeg(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(self.image.clone())
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
            .map_err(|e| IngestError::Decode(e.to_string()))?;
        Ok(buf)
    }
}

/// Wall-clock now in seconds since the Unix epoch.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_image(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, image::Rgb(rgb))
    }

    #[test]
    fn source_type_strings() {
        assert_eq!(SourceType::Rtsp.as_str(), "rtsp");
        assert_eq!(SourceType::HttpPush.as_str(), "http_push");
        assert_eq!(
            serde_json::to_string(&SourceType::HttpPush).unwrap(),
            "\"http_push\""
        );
    }

    #[test]
    fn jpeg_round_trip_keeps_dimensions() {
        let frame = Frame {
            image: solid_image(64, 48, [10, 20, 30]),
            timestamp: 1_700_000_000.0,
            source: SourceType::HttpPush,
            seq: 0,
        };

        let bytes = frame.encode_jpeg().unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 64);
        assert_eq!(decoded.height(), 48);
    }
}
