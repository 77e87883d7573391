use async_trait::async_trait;
use photo_booth_common::config::UploadConfig;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::snapshot::EncodedImage;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("upload request failed: {0}")]
    Transport(reqwest::Error),
    #[error("upload rejected with HTTP status {0}")]
    Status(u16),
    #[error("malformed upload response: {0}")]
    MalformedBody(String),
    #[error("upload response has no photo URL")]
    MissingUrl,
    #[error("upload returned an empty photo URL")]
    EmptyUrl,
}

/// Takes an encoded snapshot and returns the public URL it was stored under.
#[async_trait]
pub trait UploadGateway: Send + Sync {
    async fn upload(&self, image: EncodedImage) -> Result<String, UploadError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    photo: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Posts the snapshot as a single multipart file field.
pub struct HttpUploadGateway {
    client: reqwest::Client,
    endpoint: String,
    field: String,
}

impl HttpUploadGateway {
    pub fn new(config: &UploadConfig) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(UploadError::Client)?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            field: config.field.clone(),
        })
    }
}

#[async_trait]
impl UploadGateway for HttpUploadGateway {
    async fn upload(&self, image: EncodedImage) -> Result<String, UploadError> {
        let (part, size) = snapshot_part(image)?;
        let form = Form::new().part(self.field.clone(), part);

        debug!(endpoint = %self.endpoint, bytes = size, "uploading snapshot");

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(UploadError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(UploadError::Transport)?;
        let url = parse_upload_response(&body)?;
        info!(url = %url, bytes = size, "snapshot uploaded");
        Ok(url)
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Build the multipart file part, handing the encoded bytes over without a copy.
/// Also returns the payload size for logging.
fn snapshot_part(image: EncodedImage) -> Result<(Part, usize), UploadError> {
    let file_name = image.file_name();
    let mime = image.format.mime_type();
    let size = image.len();
    let part = Part::bytes(image.bytes)
        .file_name(file_name)
        .mime_str(mime)
        .map_err(UploadError::Client)?;
    Ok((part, size))
}

/// Pull the photo URL out of a success body. An empty string is passed
/// through; the caller decides whether it is usable.
pub fn parse_upload_response(body: &[u8]) -> Result<String, UploadError> {
    let response: UploadResponse =
        serde_json::from_slice(body).map_err(|e| UploadError::MalformedBody(e.to_string()))?;
    if let Some(message) = &response.message {
        debug!(message, "upload response message");
    }
    response.photo.ok_or(UploadError::MissingUrl)
}
