use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub link: LinkConfig,
    /// Overlay sprites drawn by the compositor, in draw order.
    #[serde(default, rename = "scene")]
    pub scenes: Vec<SceneConfig>,
    /// Static images mounted over the feed at startup.
    #[serde(default, rename = "chrome")]
    pub chrome: Vec<ChromeConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_camera_url")]
    pub url: String,
    #[serde(default = "default_quality")]
    pub quality: u32,
    #[serde(default = "default_camera_fps")]
    pub fps: f64,
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Front-facing cameras are shown mirrored, like a real mirror.
    #[serde(default = "default_true")]
    pub mirror: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_render_fps")]
    pub fps: f64,
    /// Width of the overlay canvas; height follows the live frame's aspect ratio.
    #[serde(default = "default_overlay_width")]
    pub overlay_width: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_countdown_from")]
    pub countdown_from: u32,
    #[serde(default = "default_countdown_tick_ms")]
    pub countdown_tick_ms: u64,
    #[serde(default = "default_reveal_secs")]
    pub reveal_secs: u64,
    #[serde(default)]
    pub format: SnapshotFormat,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    #[default]
    Png,
    Jpeg,
}

impl SnapshotFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            SnapshotFormat::Png => "image/png",
            SnapshotFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            SnapshotFormat::Png => "png",
            SnapshotFormat::Jpeg => "jpg",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_upload_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_upload_field")]
    pub field: String,
    #[serde(default = "default_upload_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// Pixel size of one QR module.
    #[serde(default = "default_module_px")]
    pub module_px: u32,
    #[serde(default = "default_link_output")]
    pub output_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SceneConfig {
    /// Path to an RGBA sprite image.
    pub sprite: String,
    #[serde(default)]
    pub transform: Option<TransformConfig>,
}

/// A fixed image layered over the feed, such as a frame border or a logo.
#[derive(Debug, Clone, Deserialize)]
pub struct ChromeConfig {
    /// Path to an RGBA image. Also the element id unless `id` is set.
    pub image: String,
    #[serde(default)]
    pub id: Option<String>,
    /// Offset in live-frame pixels from the top-left corner.
    #[serde(default)]
    pub x: i64,
    #[serde(default)]
    pub y: i64,
    #[serde(default)]
    pub z_index: i32,
    /// Leave the element out of snapshots (buttons, hints).
    #[serde(default)]
    pub capture_ignore: bool,
}

impl ChromeConfig {
    pub fn element_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.image)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TransformConfig {
    #[serde(default = "default_position")]
    pub position: [f32; 3],
    #[serde(default)]
    pub rotation: [f32; 3],
    #[serde(default = "default_scale")]
    pub scale: [f32; 3],
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            position: default_position(),
            rotation: [0.0; 3],
            scale: default_scale(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_storage_prefix")]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Base URL that clients use to fetch stored objects.
    #[serde(default = "default_storage_endpoint")]
    pub public_url: String,
    #[serde(default = "default_true")]
    pub public_read: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            url: default_camera_url(),
            quality: default_quality(),
            fps: default_camera_fps(),
            mode: default_mode(),
            mirror: true,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            fps: default_render_fps(),
            overlay_width: default_overlay_width(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            countdown_from: default_countdown_from(),
            countdown_tick_ms: default_countdown_tick_ms(),
            reveal_secs: default_reveal_secs(),
            format: SnapshotFormat::default(),
            jpeg_quality: default_jpeg_quality(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: default_upload_endpoint(),
            field: default_upload_field(),
            timeout_secs: default_upload_timeout(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            module_px: default_module_px(),
            output_path: default_link_output(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: default_storage_endpoint(),
            access_key: String::new(),
            secret_key: String::new(),
            bucket: default_bucket(),
            prefix: default_storage_prefix(),
            region: default_region(),
            public_url: default_storage_endpoint(),
            public_read: true,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config = Self::parse(&content)?;
        tracing::debug!(
            path = %path.display(),
            scenes = config.scenes.len(),
            chrome = config.chrome.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if config.capture.countdown_from == 0 {
            return Err(ConfigError::Invalid("capture.countdown_from must be at least 1".into()));
        }
        check_fps("render.fps", config.render.fps)?;
        check_fps("camera.fps", config.camera.fps)?;
        Ok(config)
    }
}

const MAX_FPS: f64 = 1000.0;

fn check_fps(key: &str, fps: f64) -> Result<(), ConfigError> {
    if fps.is_finite() && fps > 0.0 && fps <= MAX_FPS {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{key} must be in (0, {MAX_FPS}], got {fps}")))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_camera_url() -> String {
    "http://localhost:8080/stream".into()
}
fn default_quality() -> u32 {
    80
}
fn default_camera_fps() -> f64 {
    15.0
}
fn default_mode() -> String {
    "mjpeg".into()
}
fn default_render_fps() -> f64 {
    60.0
}
fn default_overlay_width() -> u32 {
    640
}
fn default_countdown_from() -> u32 {
    5
}
fn default_countdown_tick_ms() -> u64 {
    1000
}
fn default_reveal_secs() -> u64 {
    7
}
fn default_jpeg_quality() -> u8 {
    90
}
fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_upload_endpoint() -> String {
    "http://localhost:3000/api/v1/photo-booth".into()
}
fn default_upload_field() -> String {
    "file".into()
}
fn default_upload_timeout() -> u64 {
    30
}
fn default_module_px() -> u32 {
    4
}
fn default_link_output() -> String {
    "qr.png".into()
}
fn default_position() -> [f32; 3] {
    [0.5, 0.5, 0.0]
}
fn default_scale() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}
fn default_storage_endpoint() -> String {
    "http://localhost:9000".into()
}
fn default_bucket() -> String {
    "photo-booth".into()
}
fn default_storage_prefix() -> String {
    "photo-booth-images/".into()
}
fn default_region() -> String {
    "us-east-1".into()
}
fn default_db_path() -> String {
    "data".into()
}
fn default_api_port() -> u16 {
    3000
}
fn default_log_level() -> String {
    "info".into()
}
