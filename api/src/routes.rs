use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::db::PhotoDb;
use crate::keys::photo_key;
use crate::storage::PhotoStore;

/// Multipart field carrying the photo.
pub const FILE_FIELD: &str = "file";

const MISSING_FILE: &str = "Please upload a file.";
const INVALID_TYPE: &str = "Invalid file type. Only JPEG, JPG and PNG files are allowed.";
const UPLOAD_OK: &str = "photo image uploaded successfully!";
const UPLOAD_FAILED: &str = "Failed to upload photo.";

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub store: Arc<dyn PhotoStore>,
    pub db: Arc<PhotoDb>,
    pub prefix: String,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct UploadReply {
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    photo: Option<String>,
}

struct UploadedFile {
    file_name: String,
    content_type: String,
    data: Bytes,
}

pub fn router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/v1/photo-booth", post(upload_photo))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Both the file extension and the declared content type must be JPEG or PNG.
pub fn is_allowed_image(file_name: &str, content_type: &str) -> bool {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    let extension_ok = matches!(extension.as_str(), "jpeg" | "jpg" | "png");
    let mime_ok = matches!(
        content_type.to_ascii_lowercase().as_str(),
        "image/jpeg" | "image/jpg" | "image/png"
    );
    extension_ok && mime_ok
}

fn reply(status: StatusCode, message: &'static str, photo: Option<String>) -> Response {
    (status, Json(UploadReply { message, photo })).into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn read_file_field(multipart: &mut Multipart) -> Result<Option<UploadedFile>, Response> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Ok(None),
            Err(e) => return Err((e.status(), e.body_text()).into_response()),
        };
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| (e.status(), e.body_text()).into_response())?;
        return Ok(Some(UploadedFile {
            file_name,
            content_type,
            data,
        }));
    }
}

async fn upload_photo(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let file = match read_file_field(&mut multipart).await {
        Ok(Some(file)) => file,
        Ok(None) => return (StatusCode::BAD_REQUEST, MISSING_FILE).into_response(),
        Err(response) => return response,
    };

    if !is_allowed_image(&file.file_name, &file.content_type) {
        warn!(
            file_name = file.file_name,
            content_type = file.content_type,
            "rejected upload with invalid file type"
        );
        return (StatusCode::BAD_REQUEST, INVALID_TYPE).into_response();
    }

    let now_ms = chrono::Utc::now().timestamp_millis();
    let key = photo_key(&state.prefix, now_ms);
    let size = file.data.len();

    let url = match state.store.put_photo(&key, file.data, &file.content_type).await {
        Ok(url) => url,
        Err(e) => {
            error!(error = %e, key, "error uploading photo to storage");
            return reply(StatusCode::INTERNAL_SERVER_ERROR, UPLOAD_FAILED, None);
        }
    };

    let db = Arc::clone(&state.db);
    let link = url.clone();
    let result = tokio::task::spawn_blocking(move || db.insert_photo(&link, now_ms)).await;

    match result {
        Ok(Ok(id)) => {
            info!(id, key, size, url, "photo uploaded");
            reply(StatusCode::OK, UPLOAD_OK, Some(url))
        }
        Ok(Err(e)) => {
            error!(error = %e, key, "failed to record photo");
            reply(StatusCode::INTERNAL_SERVER_ERROR, UPLOAD_FAILED, None)
        }
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            reply(StatusCode::INTERNAL_SERVER_ERROR, UPLOAD_FAILED, None)
        }
    }
}
