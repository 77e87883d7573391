use image::RgbaImage;
use photo_booth_common::config::{ChromeConfig, Config};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::snapshot::VisualTree;
use crate::source::FrameSource;

/// The most recent overlay the compositor drew.
#[derive(Debug)]
pub struct OverlayCanvas {
    pub image: RgbaImage,
    /// Sequence number of the live frame this overlay was aligned to.
    pub frame_seq: u64,
}

/// A non-scene element in the view: logo, frame art, buttons, the QR overlay.
#[derive(Debug, Clone)]
pub struct ChromeElement {
    pub id: String,
    pub image: Arc<RgbaImage>,
    pub x: i64,
    pub y: i64,
    pub z_index: i32,
    /// Shown on screen but left out of captured snapshots.
    pub capture_ignore: bool,
}

impl ChromeElement {
    pub fn new(id: impl Into<String>, image: Arc<RgbaImage>, x: i64, y: i64) -> Self {
        Self {
            id: id.into(),
            image,
            x,
            y,
            z_index: 0,
            capture_ignore: false,
        }
    }

    pub fn with_z_index(mut self, z_index: i32) -> Self {
        self.z_index = z_index;
        self
    }

    pub fn capture_ignored(mut self) -> Self {
        self.capture_ignore = true;
        self
    }

    /// Load a configured element's image from disk.
    pub fn from_config(config: &ChromeConfig) -> Result<Self, image::ImageError> {
        let image = image::open(&config.image)?.to_rgba8();
        let element = Self::new(config.element_id(), Arc::new(image), config.x, config.y)
            .with_z_index(config.z_index);
        Ok(if config.capture_ignore {
            element.capture_ignored()
        } else {
            element
        })
    }
}

/// State shared by the render loop and the capture coordinator.
///
/// The compositor writes the overlay slot and reads frames; the coordinator
/// only reads both and mounts its own chrome. Neither holds a lock across an
/// await point.
pub struct BoothContext {
    config: Config,
    frames: FrameSource,
    overlay: watch::Sender<Option<Arc<OverlayCanvas>>>,
    chrome: Mutex<Vec<ChromeElement>>,
}

impl BoothContext {
    pub fn new(config: Config) -> Self {
        Self::with_source(config, FrameSource::new())
    }

    pub fn with_source(config: Config, frames: FrameSource) -> Self {
        let (overlay, _rx) = watch::channel(None);
        Self {
            config,
            frames,
            overlay,
            chrome: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn frames(&self) -> &FrameSource {
        &self.frames
    }

    pub fn publish_overlay(&self, canvas: OverlayCanvas) {
        self.overlay.send_replace(Some(Arc::new(canvas)));
    }

    pub fn overlay(&self) -> Option<Arc<OverlayCanvas>> {
        self.overlay.borrow().clone()
    }

    /// Add a chrome element, replacing any element with the same id.
    pub fn mount_chrome(&self, element: ChromeElement) {
        let mut chrome = self.chrome.lock().unwrap_or_else(PoisonError::into_inner);
        chrome.retain(|el| el.id != element.id);
        chrome.push(element);
    }

    /// Mount every `[[chrome]]` entry from the config. Unreadable images are
    /// skipped. Returns how many were mounted.
    pub fn mount_configured_chrome(&self) -> usize {
        let mut mounted = 0;
        for entry in &self.config.chrome {
            match ChromeElement::from_config(entry) {
                Ok(element) => {
                    info!(
                        id = %element.id,
                        z_index = element.z_index,
                        capture_ignore = element.capture_ignore,
                        "chrome mounted"
                    );
                    self.mount_chrome(element);
                    mounted += 1;
                }
                Err(e) => warn!(path = %entry.image, error = %e, "skipping unreadable chrome image"),
            }
        }
        mounted
    }

    pub fn unmount_chrome(&self, id: &str) -> bool {
        let mut chrome = self.chrome.lock().unwrap_or_else(PoisonError::into_inner);
        let before = chrome.len();
        chrome.retain(|el| el.id != id);
        chrome.len() != before
    }

    pub fn chrome(&self) -> Vec<ChromeElement> {
        self.chrome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_mounted(&self, id: &str) -> bool {
        self.chrome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|el| el.id == id)
    }

    /// The view as it stands right now. `None` until the camera delivers a frame.
    pub fn visual_tree(&self) -> Option<VisualTree> {
        let feed = self.frames.latest()?;
        Some(VisualTree {
            feed,
            mirror_feed: self.config.camera.mirror,
            overlay: self.overlay(),
            chrome: self.chrome(),
        })
    }
}
