use bytes::BytesMut;
use chrono::Utc;
use futures_util::StreamExt;
use photo_booth_common::config::CameraConfig;
use photo_booth_common::frame::FrameHandle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::source::FrameSource;

const BOUNDARY: &[u8] = b"--frame\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("unknown camera mode '{0}', expected 'mjpeg' or 'polling'")]
    UnknownMode(String),
}

/// Parse state for the MJPEG multipart stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the boundary marker `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for a `multipart/x-mixed-replace` JPEG stream.
///
/// Chunks may cut through boundaries or headers at any byte; complete JPEG
/// bodies come out in stream order.
pub struct MjpegParser {
    buffer: BytesMut,
    state: ParseState,
    /// Offset into `buffer` from which the boundary search resumes.
    scan_from: usize,
}

impl MjpegParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scan_from: 0,
        }
    }

    /// Feed one chunk, returning every JPEG body it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, BOUNDARY) {
                        let _ = self.buffer.split_to(pos + BOUNDARY.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep a tail in case the boundary spans chunks
                        if self.buffer.len() > BOUNDARY.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - BOUNDARY.len());
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.scan_from = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) = find_subsequence(&self.buffer[self.scan_from..], BOUNDARY)
                    else {
                        self.scan_from = self.buffer.len().saturating_sub(BOUNDARY.len());
                        break;
                    };
                    let jpeg_end = self.scan_from + pos;
                    // Strip trailing \r\n before boundary
                    let end = if jpeg_end >= 2
                        && self.buffer[jpeg_end - 2] == b'\r'
                        && self.buffer[jpeg_end - 1] == b'\n'
                    {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };
                    let jpeg_data = self.buffer[..end].to_vec();
                    let _ = self.buffer.split_to(jpeg_end + BOUNDARY.len());
                    if !jpeg_data.is_empty() {
                        frames.push(jpeg_data);
                    }
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        frames
    }
}

impl Default for MjpegParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Pulls frames from an HTTP camera and publishes them to a [`FrameSource`].
pub struct CameraClient {
    config: CameraConfig,
    source: FrameSource,
    seq: AtomicU64,
}

impl CameraClient {
    pub fn new(config: CameraConfig, source: FrameSource) -> Self {
        Self {
            config,
            source,
            seq: AtomicU64::new(0),
        }
    }

    /// Run until the task is dropped. Only returns on a configuration error.
    pub async fn run(&self) -> Result<(), SourceError> {
        match self.config.mode.as_str() {
            "mjpeg" => {
                let url = format!(
                    "{}?quality={}&fps={}",
                    self.config.url, self.config.quality, self.config.fps
                );
                self.run_mjpeg(&url).await;
                Ok(())
            }
            "polling" => {
                let url = format!(
                    "{}?quality={}",
                    self.config.url.replace("/stream", "/frame"),
                    self.config.quality
                );
                let interval = Duration::from_secs_f64(1.0 / self.config.fps.max(0.1));
                self.run_polling(&url, interval).await;
                Ok(())
            }
            other => Err(SourceError::UnknownMode(other.to_string())),
        }
    }

    /// Consume the MJPEG stream, reconnecting with exponential backoff on failure.
    async fn run_mjpeg(&self, stream_url: &str) {
        let mut backoff = Duration::from_secs(2);
        let max_backoff = Duration::from_secs(30);

        loop {
            info!(url = stream_url, "connecting to MJPEG stream");
            match self.consume_stream(stream_url).await {
                Ok(()) => {
                    info!("stream ended cleanly, reconnecting");
                    backoff = Duration::from_secs(2);
                }
                Err(e) => {
                    error!(error = %e, "stream error, reconnecting in {:?}", backoff);
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    async fn consume_stream(&self, url: &str) -> Result<(), SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(SourceError::HttpConnect)?;
        let response = client
            .get(url)
            .send()
            .await
            .map_err(SourceError::HttpConnect)?;

        if !response.status().is_success() {
            return Err(SourceError::HttpStatus(response.status().as_u16()));
        }

        info!(status = %response.status(), "connected to MJPEG stream");

        let mut byte_stream = response.bytes_stream();
        let mut parser = MjpegParser::new();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(SourceError::HttpStream)?;
            for jpeg_data in parser.push(&chunk) {
                self.publish_jpeg(&jpeg_data);
            }
        }

        Ok(())
    }

    /// Polling fallback: periodically fetch single frames.
    async fn run_polling(&self, frame_url: &str, interval: Duration) {
        let client = reqwest::Client::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            match client.get(frame_url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                    Ok(body) => self.publish_jpeg(&body),
                    Err(e) => warn!(error = %e, "failed to read camera frame body"),
                },
                Ok(resp) => {
                    warn!(status = %resp.status(), "non-success response from camera");
                }
                Err(e) => {
                    warn!(error = %e, "failed to fetch camera frame");
                }
            }
        }
    }

    fn publish_jpeg(&self, jpeg_data: &[u8]) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let now_ms = Utc::now().timestamp_millis();
        match FrameHandle::decode_jpeg(jpeg_data, now_ms, seq) {
            Ok(frame) => {
                if seq % 100 == 0 {
                    debug!(
                        seq,
                        width = frame.width(),
                        height = frame.height(),
                        "camera frames received"
                    );
                }
                self.source.publish(frame);
            }
            Err(e) => {
                warn!(error = %e, seq, bytes = jpeg_data.len(), "failed to decode camera frame, skipping");
            }
        }
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
