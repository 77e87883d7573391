use chrono::{DateTime, TimeZone, Utc};
use image::RgbaImage;
use std::sync::Arc;

/// A decoded camera frame with timestamp metadata.
///
/// Pixels are shared behind an `Arc` so the render loop and a capture can
/// both hold the same frame without copying it. Consumers must not keep a
/// handle across ticks; the source replaces it on every new frame.
#[derive(Debug, Clone)]
pub struct FrameHandle {
    pub image: Arc<RgbaImage>,
    /// Unix millis at which the frame was received from the camera.
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl FrameHandle {
    pub fn new(image: RgbaImage, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            image: Arc::new(image),
            captured_at_ms,
            seq,
        }
    }

    /// Decode a JPEG frame as delivered by an MJPEG stream or a single-frame endpoint.
    pub fn decode_jpeg(jpeg_data: &[u8], captured_at_ms: i64, seq: u64) -> Result<Self, FrameError> {
        if jpeg_data.is_empty() {
            return Err(FrameError::Empty);
        }
        let img = image::load_from_memory_with_format(jpeg_data, image::ImageFormat::Jpeg)
            .map_err(|e| FrameError::Decode(e.to_string()))?;
        let rgba = img.to_rgba8();
        if rgba.width() == 0 || rgba.height() == 0 {
            return Err(FrameError::Empty);
        }
        Ok(Self::new(rgba, captured_at_ms, seq))
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.captured_at_ms)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Width over height. `None` for a degenerate zero-height frame.
    pub fn aspect(&self) -> Option<f32> {
        if self.height() == 0 {
            return None;
        }
        Some(self.width() as f32 / self.height() as f32)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame payload is empty")]
    Empty,
    #[error("failed to decode frame: {0}")]
    Decode(String),
}
