use image::imageops::{self, FilterType};
use image::RgbaImage;
use photo_booth_common::config::TransformConfig;
use photo_booth_common::frame::FrameHandle;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::context::{BoothContext, OverlayCanvas};

/// Placement of a model on the overlay canvas.
///
/// Positions are normalized to the canvas (0..1, origin top-left). Scale 1.0
/// spans the full canvas width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: [f32; 3],
    pub rotation: [f32; 3],
    pub scale: [f32; 3],
}

impl Default for Transform {
    fn default() -> Self {
        TransformConfig::default().into()
    }
}

impl From<TransformConfig> for Transform {
    fn from(t: TransformConfig) -> Self {
        Self {
            position: t.position,
            rotation: t.rotation,
            scale: t.scale,
        }
    }
}

/// Something the compositor can draw. Loading and posing real 3D models
/// lives behind this trait.
pub trait OverlayModel: Send + Sync {
    fn draw(&self, canvas: &mut RgbaImage, transform: &Transform);

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// One model plus its optional placement. Later entries draw on top.
#[derive(Clone)]
pub struct SceneSetup {
    pub model: Arc<dyn OverlayModel>,
    pub transform: Option<Transform>,
}

impl SceneSetup {
    pub fn new(model: Arc<dyn OverlayModel>) -> Self {
        Self {
            model,
            transform: None,
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }
}

/// A flat RGBA image drawn screen-aligned; rotation is ignored.
pub struct Sprite {
    name: String,
    image: RgbaImage,
    /// Last resized copy, keyed by target size. Avoids a resize every tick.
    cache: Mutex<Option<((u32, u32), RgbaImage)>>,
}

impl Sprite {
    pub fn new(name: impl Into<String>, image: RgbaImage) -> Self {
        Self {
            name: name.into(),
            image,
            cache: Mutex::new(None),
        }
    }

    pub fn open(path: &Path) -> Result<Self, image::ImageError> {
        let image = image::open(path)?.to_rgba8();
        Ok(Self::new(path.display().to_string(), image))
    }

    fn target_size(&self, canvas: &RgbaImage, transform: &Transform) -> Option<(u32, u32)> {
        if self.image.width() == 0 || transform.scale[0] <= 0.0 || transform.scale[1] <= 0.0 {
            return None;
        }
        let width = canvas.width() as f32 * transform.scale[0];
        let natural_height =
            width * self.image.height() as f32 / self.image.width() as f32;
        let height = natural_height * transform.scale[1] / transform.scale[0];
        let (w, h) = (width.round() as u32, height.round() as u32);
        (w > 0 && h > 0).then_some((w, h))
    }
}

impl OverlayModel for Sprite {
    fn draw(&self, canvas: &mut RgbaImage, transform: &Transform) {
        let Some((w, h)) = self.target_size(canvas, transform) else {
            return;
        };
        let x = (transform.position[0] * canvas.width() as f32 - w as f32 / 2.0).round() as i64;
        let y = (transform.position[1] * canvas.height() as f32 - h as f32 / 2.0).round() as i64;

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.as_ref().map(|(size, _)| *size) != Some((w, h)) {
            let resized = imageops::resize(&self.image, w, h, FilterType::Triangle);
            *cache = Some(((w, h), resized));
        }
        if let Some((_, resized)) = cache.as_ref() {
            imageops::overlay(canvas, resized, x, y);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Error returned by a per-tick callback.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TickError(String);

impl TickError {
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self(msg.into())
    }
}

impl From<&str> for TickError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for TickError {
    fn from(value: String) -> Self {
        Self(value)
    }
}

pub type TickCallback = Box<dyn FnMut(&FrameHandle) -> Result<(), TickError> + Send>;

/// Counters for the render loop.
#[derive(Debug, Default)]
pub struct RenderStats {
    ticks: AtomicU64,
    renders: AtomicU64,
    callback_failures: AtomicU64,
    model_failures: AtomicU64,
}

impl RenderStats {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn renders(&self) -> u64 {
        self.renders.load(Ordering::Relaxed)
    }

    pub fn callback_failures(&self) -> u64 {
        self.callback_failures.load(Ordering::Relaxed)
    }

    /// Model draws that panicked. The tick still publishes what the other
    /// models drew.
    pub fn model_failures(&self) -> u64 {
        self.model_failures.load(Ordering::Relaxed)
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No live frame yet; nothing drawn.
    NoFrame,
    Rendered,
}

type SceneList = Arc<Mutex<Arc<Vec<SceneSetup>>>>;

/// Draws the scene overlay for the latest live frame on every tick.
pub struct OverlayCompositor {
    ctx: Arc<BoothContext>,
    scenes: SceneList,
    on_tick: Option<TickCallback>,
    stats: Arc<RenderStats>,
    overlay_width: u32,
    mirror: bool,
    period: Duration,
}

impl OverlayCompositor {
    pub fn new(ctx: Arc<BoothContext>) -> Self {
        let render = &ctx.config().render;
        let period = Duration::from_secs_f64(1.0 / render.fps);
        let overlay_width = render.overlay_width.max(1);
        let mirror = ctx.config().camera.mirror;
        Self {
            ctx,
            scenes: Arc::new(Mutex::new(Arc::new(Vec::new()))),
            on_tick: None,
            stats: Arc::new(RenderStats::default()),
            overlay_width,
            mirror,
            period,
        }
    }

    pub fn with_scenes(self, scenes: Vec<SceneSetup>) -> Self {
        *self.scenes.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(scenes);
        self
    }

    /// Run `callback` with each tick's frame before the overlay is drawn,
    /// e.g. for face tracking that positions the scene.
    pub fn on_tick<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&FrameHandle) -> Result<(), TickError> + Send + 'static,
    {
        self.on_tick = Some(Box::new(callback));
        self
    }

    pub fn stats(&self) -> Arc<RenderStats> {
        Arc::clone(&self.stats)
    }

    /// Run one iteration of the loop. Never fails: callback errors and
    /// panics are logged and counted.
    pub fn tick(&mut self) -> TickOutcome {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let Some(frame) = self.ctx.frames().latest() else {
            return TickOutcome::NoFrame;
        };

        if let Some(callback) = self.on_tick.as_mut() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| callback(frame.as_ref())));
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("callback panicked".to_string()),
            };
            if let Some(reason) = failure {
                let failures = self.stats.callback_failures.fetch_add(1, Ordering::Relaxed) + 1;
                log_failure("per-tick callback failed", &reason, frame.seq, failures);
            }
        }

        let Some(aspect) = frame.aspect() else {
            return TickOutcome::NoFrame;
        };
        let image = self.draw(aspect, frame.seq);
        self.ctx.publish_overlay(OverlayCanvas {
            image,
            frame_seq: frame.seq,
        });
        self.stats.renders.fetch_add(1, Ordering::Relaxed);
        TickOutcome::Rendered
    }

    fn draw(&self, aspect: f32, seq: u64) -> RgbaImage {
        let height = (self.overlay_width as f32 / aspect).round().max(1.0) as u32;
        let mut canvas = RgbaImage::new(self.overlay_width, height);

        let scenes = Arc::clone(&self.scenes.lock().unwrap_or_else(PoisonError::into_inner));
        for setup in scenes.iter() {
            let transform = setup.transform.unwrap_or_default();
            let drawn = panic::catch_unwind(AssertUnwindSafe(|| {
                setup.model.draw(&mut canvas, &transform)
            }));
            if drawn.is_err() {
                let failures = self.stats.model_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let reason = format!("model '{}' panicked while drawing", setup.model.name());
                log_failure("scene draw failed", &reason, seq, failures);
            }
        }

        if self.mirror {
            imageops::flip_horizontal_in_place(&mut canvas);
        }
        canvas
    }

    /// Spawn the render loop on the current runtime.
    pub fn start(mut self) -> CompositorHandle {
        let stats = self.stats();
        let scenes = Arc::clone(&self.scenes);
        let period = self.period;

        info!(
            fps = format!("{:.1}", 1.0 / period.as_secs_f64()),
            overlay_width = self.overlay_width,
            mirror = self.mirror,
            "starting render loop"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.tick();
            }
        });

        CompositorHandle {
            task,
            stats,
            scenes,
            period,
        }
    }
}

/// Warn on the first failure and every 300th after that; debug otherwise.
fn log_failure(what: &'static str, reason: &str, seq: u64, failures: u64) {
    if failures == 1 || failures % 300 == 0 {
        warn!(error = reason, seq, failures, "{what}");
    } else {
        debug!(error = reason, seq, "{what}");
    }
}

/// Control handle for a running render loop.
pub struct CompositorHandle {
    task: JoinHandle<()>,
    stats: Arc<RenderStats>,
    scenes: SceneList,
    period: Duration,
}

impl CompositorHandle {
    pub fn stats(&self) -> &RenderStats {
        &self.stats
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Replace the scene list; takes effect on the next tick.
    pub fn set_scenes(&self, scenes: Vec<SceneSetup>) {
        *self.scenes.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(scenes);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(self) {
        self.task.abort();
        if self.stats.callback_failures() > 0 {
            error!(
                failures = self.stats.callback_failures(),
                "render loop stopped with callback failures"
            );
        }
        info!(
            ticks = self.stats.ticks(),
            renders = self.stats.renders(),
            model_failures = self.stats.model_failures(),
            "render loop stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use photo_booth_common::config::Config;

    fn context(fps: f64, mirror: bool) -> Arc<BoothContext> {
        let mut config = Config::default();
        config.render.fps = fps;
        config.render.overlay_width = 64;
        config.camera.mirror = mirror;
        Arc::new(BoothContext::new(config))
    }

    fn publish(ctx: &BoothContext, width: u32, height: u32, seq: u64) {
        ctx.frames()
            .publish(FrameHandle::new(RgbaImage::new(width, height), 0, seq));
    }

    fn close_to(pixel: &Rgba<u8>, expected: [u8; 4]) -> bool {
        pixel
            .0
            .iter()
            .zip(expected)
            .all(|(a, b)| a.abs_diff(b) <= 2)
    }

    fn red_square() -> Arc<dyn OverlayModel> {
        Arc::new(Sprite::new(
            "red",
            RgbaImage::from_pixel(4, 4, Rgba([255, 0, 0, 255])),
        ))
    }

    #[test]
    fn no_frame_is_a_noop_tick() {
        let ctx = context(60.0, false);
        let called = Arc::new(AtomicU64::new(0));
        let called_cb = Arc::clone(&called);
        let mut compositor = OverlayCompositor::new(ctx.clone()).on_tick(move |_| {
            called_cb.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        assert_eq!(compositor.tick(), TickOutcome::NoFrame);
        assert_eq!(called.load(Ordering::Relaxed), 0);
        assert_eq!(compositor.stats().ticks(), 1);
        assert_eq!(compositor.stats().renders(), 0);
        assert!(ctx.overlay().is_none());
    }

    #[test]
    fn callback_runs_before_drawing_with_current_frame() {
        let ctx = context(60.0, false);
        publish(&ctx, 32, 18, 9);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let ctx_cb = Arc::clone(&ctx);
        let mut compositor = OverlayCompositor::new(ctx.clone()).on_tick(move |frame| {
            // The overlay for this frame has not been drawn yet.
            let drawn = ctx_cb.overlay().map(|o| o.frame_seq);
            seen_cb.lock().unwrap().push((frame.seq, drawn));
            Ok(())
        });
        assert_eq!(compositor.tick(), TickOutcome::Rendered);
        assert_eq!(*seen.lock().unwrap(), vec![(9, None)]);
        assert_eq!(ctx.overlay().unwrap().frame_seq, 9);
    }

    #[test]
    fn overlay_follows_frame_aspect_every_tick() {
        let ctx = context(60.0, false);
        let mut compositor = OverlayCompositor::new(ctx.clone());

        publish(&ctx, 1280, 720, 1);
        compositor.tick();
        let landscape = ctx.overlay().unwrap();
        assert_eq!(landscape.image.dimensions(), (64, 36));

        // Device rotated: the stream renegotiates to portrait.
        publish(&ctx, 720, 1280, 2);
        compositor.tick();
        let portrait = ctx.overlay().unwrap();
        assert_eq!(portrait.image.dimensions(), (64, 114));
    }

    #[test]
    fn later_scenes_draw_on_top() {
        let ctx = context(60.0, false);
        publish(&ctx, 64, 64, 1);
        let blue: Arc<dyn OverlayModel> = Arc::new(Sprite::new(
            "blue",
            RgbaImage::from_pixel(4, 4, Rgba([0, 0, 255, 255])),
        ));
        let centered = Transform {
            scale: [0.5, 0.5, 1.0],
            ..Transform::default()
        };
        let mut compositor = OverlayCompositor::new(ctx.clone()).with_scenes(vec![
            SceneSetup::new(red_square()).with_transform(centered),
            SceneSetup::new(blue).with_transform(centered),
        ]);
        compositor.tick();
        let overlay = ctx.overlay().unwrap();
        assert!(close_to(overlay.image.get_pixel(32, 32), [0, 0, 255, 255]));
        assert_eq!(overlay.image.get_pixel(0, 0).0[3], 0, "background stays transparent");
    }

    #[test]
    fn overlay_is_mirrored_with_the_feed() {
        let left = Transform {
            position: [0.25, 0.5, 0.0],
            scale: [0.25, 0.25, 1.0],
            ..Transform::default()
        };

        let ctx = context(60.0, true);
        publish(&ctx, 64, 64, 1);
        let mut compositor = OverlayCompositor::new(ctx.clone())
            .with_scenes(vec![SceneSetup::new(red_square()).with_transform(left)]);
        compositor.tick();
        let overlay = ctx.overlay().unwrap();
        assert_eq!(overlay.image.get_pixel(16, 32).0[3], 0);
        assert!(close_to(overlay.image.get_pixel(47, 32), [255, 0, 0, 255]));
    }

    #[test]
    fn panicking_callback_is_contained() {
        let ctx = context(60.0, false);
        publish(&ctx, 16, 9, 1);
        let mut compositor =
            OverlayCompositor::new(ctx.clone()).on_tick(|_| panic!("tracker crashed"));
        assert_eq!(compositor.tick(), TickOutcome::Rendered);
        assert_eq!(compositor.tick(), TickOutcome::Rendered);
        assert_eq!(compositor.stats().callback_failures(), 2);
        assert_eq!(compositor.stats().renders(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_callback_never_stops_the_loop() {
        // 100 fps keeps the tick period a whole number of milliseconds.
        let ctx = context(100.0, false);
        publish(&ctx, 32, 18, 1);
        let compositor =
            OverlayCompositor::new(ctx.clone()).on_tick(|_| Err(TickError::msg("tracker failed")));
        let handle = compositor.start();
        let period = handle.period();
        assert_eq!(period, Duration::from_millis(10));

        // The first tick fires immediately, then one per period.
        tokio::time::sleep(period * 999 + period / 2).await;
        assert_eq!(handle.stats().renders(), 1000);
        assert_eq!(handle.stats().callback_failures(), 1000);
        assert!(handle.is_running());

        tokio::time::sleep(period).await;
        assert_eq!(handle.stats().renders(), 1001);
        assert!(handle.is_running());
        handle.stop();
    }

    struct Exploding;

    impl OverlayModel for Exploding {
        fn draw(&self, _canvas: &mut RgbaImage, _transform: &Transform) {
            panic!("model asset failed to load");
        }

        fn name(&self) -> &str {
            "exploding"
        }
    }

    #[test]
    fn panicking_model_skips_only_itself() {
        let ctx = context(60.0, false);
        publish(&ctx, 64, 64, 1);
        let centered = Transform {
            scale: [0.5, 0.5, 1.0],
            ..Transform::default()
        };
        let mut compositor = OverlayCompositor::new(ctx.clone()).with_scenes(vec![
            SceneSetup::new(Arc::new(Exploding)),
            SceneSetup::new(red_square()).with_transform(centered),
        ]);
        assert_eq!(compositor.tick(), TickOutcome::Rendered);
        assert_eq!(compositor.stats().model_failures(), 1);
        assert_eq!(compositor.stats().renders(), 1);
        let overlay = ctx.overlay().unwrap();
        assert!(close_to(overlay.image.get_pixel(32, 32), [255, 0, 0, 255]));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_model_never_stops_the_loop() {
        let ctx = context(100.0, false);
        publish(&ctx, 32, 18, 1);
        let handle = OverlayCompositor::new(ctx.clone())
            .with_scenes(vec![SceneSetup::new(Arc::new(Exploding))])
            .start();
        let period = handle.period();

        tokio::time::sleep(period * 9 + period / 2).await;
        assert!(handle.is_running());
        assert_eq!(handle.stats().ticks(), 10);
        assert_eq!(handle.stats().renders(), 10);
        assert_eq!(handle.stats().model_failures(), 10);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn scenes_can_be_swapped_while_running() {
        let ctx = context(100.0, false);
        publish(&ctx, 64, 64, 1);
        let handle = OverlayCompositor::new(ctx.clone()).start();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(ctx.overlay().unwrap().image.get_pixel(32, 32).0[3], 0);

        handle.set_scenes(vec![SceneSetup::new(red_square()).with_transform(Transform {
            scale: [0.5, 0.5, 1.0],
            ..Transform::default()
        })]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(close_to(
            ctx.overlay().unwrap().image.get_pixel(32, 32),
            [255, 0, 0, 255]
        ));
        handle.stop();
    }
}
