use std::path::{Path, PathBuf};
use std::sync::Arc;

use photo_booth::camera::CameraClient;
use photo_booth::capture::{CaptureCoordinator, CapturePhase, TriggerOutcome};
use photo_booth::compositor::{OverlayCompositor, SceneSetup, Sprite, Transform};
use photo_booth::context::BoothContext;
use photo_booth::upload::HttpUploadGateway;
use photo_booth_common::config::Config;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        camera = config.camera.url,
        mode = config.camera.mode,
        upload = config.upload.endpoint,
        scenes = config.scenes.len(),
        chrome = config.chrome.len(),
        "starting photo booth"
    );

    let scenes = load_scenes(&config);
    let gateway = match HttpUploadGateway::new(&config.upload) {
        Ok(g) => Arc::new(g),
        Err(e) => {
            error!(error = %e, "failed to create upload client");
            std::process::exit(1);
        }
    };
    let qr_output = PathBuf::from(&config.link.output_path);
    let camera_config = config.camera.clone();
    let ctx = Arc::new(BoothContext::new(config));
    let chrome = ctx.mount_configured_chrome();
    info!(chrome, "static chrome mounted");

    let camera = CameraClient::new(camera_config, ctx.frames().clone());
    let camera_task = tokio::spawn(async move {
        if let Err(e) = camera.run().await {
            error!(error = %e, "camera client stopped");
        }
    });

    let render = OverlayCompositor::new(Arc::clone(&ctx))
        .with_scenes(scenes)
        .on_tick(|frame| {
            debug!(
                seq = frame.seq,
                captured_at = %frame.captured_at(),
                width = frame.width(),
                height = frame.height(),
                "render tick"
            );
            Ok(())
        })
        .start();

    let coordinator = CaptureCoordinator::new(Arc::clone(&ctx), gateway);
    let reveal_task = tokio::spawn(write_revealed_links(coordinator.clone(), qr_output));

    println!("photo booth ready: <enter> or 'c' to capture, 'd' to dismiss, 'q' to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "failed to read stdin");
                break;
            }
        };
        match line.trim() {
            "" | "c" => match coordinator.trigger() {
                TriggerOutcome::Started { session_id } => info!(session_id, "capture started"),
                TriggerOutcome::Rejected { phase } => {
                    info!(%phase, "capture already in progress")
                }
            },
            "d" => {
                if !coordinator.dismiss() {
                    info!("nothing to dismiss");
                }
            }
            "q" => break,
            other => warn!(command = other, "unknown command"),
        }
    }

    info!(
        ticks = render.stats().ticks(),
        renders = render.stats().renders(),
        callback_failures = render.stats().callback_failures(),
        model_failures = render.stats().model_failures(),
        "shutting down"
    );
    render.stop();
    reveal_task.abort();
    camera_task.abort();
}

/// Build one sprite scene per `[[scene]]` entry. Unreadable sprites are skipped.
fn load_scenes(config: &Config) -> Vec<SceneSetup> {
    let mut scenes = Vec::with_capacity(config.scenes.len());
    for scene in &config.scenes {
        let sprite = match Sprite::open(Path::new(&scene.sprite)) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = scene.sprite, error = %e, "skipping unreadable sprite");
                continue;
            }
        };
        let mut setup = SceneSetup::new(Arc::new(sprite));
        if let Some(transform) = scene.transform {
            setup = setup.with_transform(Transform::from(transform));
        }
        scenes.push(setup);
    }
    scenes
}

/// Save each revealed QR code so an external display can pick it up.
async fn write_revealed_links(coordinator: CaptureCoordinator, path: PathBuf) {
    let mut views = coordinator.watch();
    let mut last_written = 0;
    while views.changed().await.is_ok() {
        let view = views.borrow_and_update().clone();
        if view.phase != CapturePhase::Revealed || view.session_id == last_written {
            continue;
        }
        let Some(link) = view.link else { continue };
        last_written = view.session_id;
        match tokio::fs::write(&path, &link.qr_png).await {
            Ok(()) => info!(url = %link.url, path = %path.display(), "photo link ready"),
            Err(e) => error!(path = %path.display(), error = %e, "failed to write QR code"),
        }
    }
}
