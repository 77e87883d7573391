mod db;
mod keys;
mod routes;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use photo_booth_common::config::Config;
use tracing::{error, info};

use crate::db::PhotoDb;
use crate::routes::{router, AppState};
use crate::storage::S3PhotoStore;

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
        endpoint = config.storage.endpoint,
        bucket = config.storage.bucket,
        prefix = config.storage.prefix,
        "starting photo-booth API"
    );

    let store = S3PhotoStore::new(&config.storage).await;
    if let Err(e) = store.ensure_bucket().await {
        error!(error = %e, "failed to ensure bucket exists");
        std::process::exit(1);
    }

    let db = match PhotoDb::open(&PathBuf::from(&config.database.path)) {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, path = config.database.path, "failed to open database");
            std::process::exit(1);
        }
    };
    match db.count() {
        Ok(photos) => info!(photos, "photo records loaded"),
        Err(e) => error!(error = %e, "failed to count photo records"),
    }

    let state = Arc::new(AppState {
        store: Arc::new(store),
        db: Arc::new(db),
        prefix: config.storage.prefix.clone(),
    });
    let app = router(state, config.api.max_upload_bytes);

    let addr = format!("0.0.0.0:{}", config.api.port);
    info!(addr, "photo-booth API server starting");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
