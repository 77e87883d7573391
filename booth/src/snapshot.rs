use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ExtendedColorType, ImageEncoder, RgbaImage};
use photo_booth_common::config::{CaptureConfig, SnapshotFormat};
use photo_booth_common::frame::FrameHandle;
use std::sync::Arc;
use tracing::debug;

use crate::context::{BoothContext, ChromeElement, OverlayCanvas};

/// Everything on screen at one instant, bottom to top: live feed, scene
/// overlay, then chrome by ascending z-index.
#[derive(Debug, Clone)]
pub struct VisualTree {
    pub feed: Arc<FrameHandle>,
    pub mirror_feed: bool,
    pub overlay: Option<Arc<OverlayCanvas>>,
    pub chrome: Vec<ChromeElement>,
}

impl VisualTree {
    /// Flatten the capturable layers onto a transparent canvas the size of
    /// the live feed. Capture-ignored chrome is skipped.
    pub fn rasterize(&self) -> RgbaImage {
        let (width, height) = (self.feed.width(), self.feed.height());
        let mut out = RgbaImage::new(width, height);

        if self.mirror_feed {
            let mirrored = imageops::flip_horizontal(&*self.feed.image);
            imageops::overlay(&mut out, &mirrored, 0, 0);
        } else {
            imageops::overlay(&mut out, &*self.feed.image, 0, 0);
        }

        if let Some(overlay) = &self.overlay {
            if overlay.image.dimensions() == (width, height) {
                imageops::overlay(&mut out, &overlay.image, 0, 0);
            } else {
                let scaled = imageops::resize(&overlay.image, width, height, FilterType::Triangle);
                imageops::overlay(&mut out, &scaled, 0, 0);
            }
        }

        let mut chrome: Vec<&ChromeElement> =
            self.chrome.iter().filter(|el| !el.capture_ignore).collect();
        chrome.sort_by_key(|el| el.z_index);
        for el in chrome {
            imageops::overlay(&mut out, &*el.image, el.x, el.y);
        }

        out
    }
}

/// Encoded still, ready for a single upload.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub format: SnapshotFormat,
    pub width: u32,
    pub height: u32,
}

impl EncodedImage {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn file_name(&self) -> String {
        format!("screenshot.{}", self.format.extension())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("nothing to capture: no live frame is mounted")]
    Unmounted,
    #[error("failed to encode snapshot: {0}")]
    Encode(String),
    #[error("encoded snapshot is empty")]
    Empty,
    #[error("encoded snapshot is {size} bytes, over the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
}

/// Rasterizes the current view and encodes it for upload.
#[derive(Debug, Clone)]
pub struct SnapshotEncoder {
    format: SnapshotFormat,
    jpeg_quality: u8,
    max_bytes: usize,
}

impl SnapshotEncoder {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            format: config.format,
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
            max_bytes: config.max_upload_bytes,
        }
    }

    /// Snapshot whatever the context shows right now. CPU bound; call from
    /// a blocking thread.
    pub fn capture(&self, ctx: &BoothContext) -> Result<EncodedImage, EncodingError> {
        let tree = ctx.visual_tree().ok_or(EncodingError::Unmounted)?;
        self.encode(&tree)
    }

    pub fn encode(&self, tree: &VisualTree) -> Result<EncodedImage, EncodingError> {
        let pixels = tree.rasterize();
        let (width, height) = pixels.dimensions();
        if width == 0 || height == 0 {
            return Err(EncodingError::Unmounted);
        }

        let mut bytes = Vec::new();
        match self.format {
            SnapshotFormat::Png => {
                PngEncoder::new(&mut bytes)
                    .write_image(pixels.as_raw(), width, height, ExtendedColorType::Rgba8)
                    .map_err(|e| EncodingError::Encode(e.to_string()))?;
            }
            SnapshotFormat::Jpeg => {
                // JPEG has no alpha channel.
                let rgb = DynamicImage::ImageRgba8(pixels).to_rgb8();
                JpegEncoder::new_with_quality(&mut bytes, self.jpeg_quality)
                    .encode_image(&rgb)
                    .map_err(|e| EncodingError::Encode(e.to_string()))?;
            }
        }

        if bytes.is_empty() {
            return Err(EncodingError::Empty);
        }
        if bytes.len() > self.max_bytes {
            return Err(EncodingError::TooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }

        debug!(
            width,
            height,
            bytes = bytes.len(),
            format = self.format.extension(),
            "snapshot encoded"
        );

        Ok(EncodedImage {
            bytes,
            format: self.format,
            width,
            height,
        })
    }
}
