use image::codecs::png::PngEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, Luma, RgbaImage};
use photo_booth_common::config::LinkConfig;
use qrcode::QrCode;
use reqwest::Url;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum LinkDerivationError {
    #[error("artifact URL is empty")]
    Empty,
    #[error("artifact URL is not a valid http(s) URL: {0}")]
    InvalidUrl(String),
    #[error("failed to encode QR code: {0}")]
    Encode(String),
}

/// The uploaded photo's URL and its on-screen QR code.
#[derive(Debug, Clone)]
pub struct ArtifactLink {
    pub url: String,
    pub qr: RgbaImage,
    pub qr_png: Vec<u8>,
    /// When the QR code should come off screen.
    pub expires_at: Instant,
}

impl ArtifactLink {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

pub struct ArtifactLinkPresenter {
    module_px: u32,
    display_for: Duration,
}

impl ArtifactLinkPresenter {
    pub fn new(config: &LinkConfig, display_for: Duration) -> Self {
        Self {
            module_px: config.module_px.max(1),
            display_for,
        }
    }

    /// Render `url` as a QR code. The display window starts when this returns.
    pub fn derive(&self, url: &str) -> Result<ArtifactLink, LinkDerivationError> {
        validate_url(url)?;

        let qr = render_qr(url, self.module_px)?;
        let mut qr_png = Vec::new();
        PngEncoder::new(&mut qr_png)
            .write_image(qr.as_raw(), qr.width(), qr.height(), ExtendedColorType::Rgba8)
            .map_err(|e| LinkDerivationError::Encode(e.to_string()))?;

        debug!(url, size = qr.width(), "derived QR code");

        Ok(ArtifactLink {
            url: url.to_string(),
            qr,
            qr_png,
            expires_at: Instant::now() + self.display_for,
        })
    }
}

/// Require an absolute http(s) URL with a host.
pub fn validate_url(url: &str) -> Result<Url, LinkDerivationError> {
    if url.trim().is_empty() {
        return Err(LinkDerivationError::Empty);
    }
    let parsed = Url::parse(url).map_err(|e| LinkDerivationError::InvalidUrl(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(LinkDerivationError::InvalidUrl(format!(
            "unsupported scheme '{}'",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(LinkDerivationError::InvalidUrl("missing host".into()));
    }
    Ok(parsed)
}

fn render_qr(data: &str, module_px: u32) -> Result<RgbaImage, LinkDerivationError> {
    let code = QrCode::new(data.as_bytes()).map_err(|e| LinkDerivationError::Encode(e.to_string()))?;
    let luma = code
        .render::<Luma<u8>>()
        .module_dimensions(module_px, module_px)
        .quiet_zone(true)
        .build();
    Ok(DynamicImage::ImageLuma8(luma).to_rgba8())
}
