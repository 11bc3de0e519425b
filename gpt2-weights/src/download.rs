//! Streamed download of the weight blob.

use crate::error::{Result, WeightsError};
use log::{debug, info};
use reqwest::blocking::Client;
use std::io::Read;
use std::time::Duration;

/// Public location of the GPT-2 124M float blob.
pub const DEFAULT_WEIGHTS_URL: &str =
    "https://huggingface.co/gpt2124mmodel/GPT2-Model-124M-For-Frontend/resolve/main/values.bin";

/// Size of a single body read.
const CHUNK_SIZE: usize = 1 << 16;

/// Upper bound on the buffer reserved up front from `Content-Length`; the payload grows past it as needed.
const MAX_PREALLOC: u64 = 512 << 20;

/// Something that can produce the raw weight payload.
pub trait WeightSource {
    /// Fetches the whole payload, reporting integer percentage progress (0-100) through `on_progress`.
    fn fetch(&self, on_progress: &mut dyn FnMut(u8)) -> Result<Vec<u8>>;
}

/// Tracks received bytes against an optional total and emits progress only when the percentage moves.
#[derive(Debug)]
pub struct ProgressTracker {
    total: Option<u64>,
    received: u64,
    last_reported: Option<u8>,
}

impl ProgressTracker {
    pub fn new(total: Option<u64>) -> Self {
        Self { total: total.filter(|&t| t > 0), received: 0, last_reported: None }
    }

    /// Records `bytes` more received bytes and returns the new percentage if it changed.
    pub fn advance(&mut self, bytes: usize) -> Option<u8> {
        self.received += bytes as u64;
        let total = self.total?;

        let percent = ((self.received as f64 / total as f64) * 100.0).round().min(100.0) as u8;
        if self.last_reported == Some(percent) {
            return None;
        }
        self.last_reported = Some(percent);
        Some(percent)
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

/// Downloads the weight blob over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpWeightSource {
    url: String,
    client: Client,
}

impl HttpWeightSource {
    pub fn new(url: &str) -> Result<Self> {
        // No internal timeout: a stalled transfer blocks until the peer gives up.
        let client = Client::builder()
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| WeightsError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { url: url.to_string(), client })
    }

}

impl WeightSource for HttpWeightSource {
    fn fetch(&self, on_progress: &mut dyn FnMut(u8)) -> Result<Vec<u8>> {
        info!("🌐 Downloading weights from {}", self.url);

        let mut response = self
            .client
            .get(&self.url)
            .send()
            .map_err(|e| WeightsError::Network(format!("request to {} failed: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WeightsError::Network(format!(
                "failed to fetch file with status ({}) {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )));
        }

        let content_length = response.content_length();
        debug!("Content-Length: {content_length:?}");

        let mut tracker = ProgressTracker::new(content_length);
        let mut payload = Vec::with_capacity(content_length.map_or(0, |n| n.min(MAX_PREALLOC)) as usize);
        let mut chunk = vec![0u8; CHUNK_SIZE];

        loop {
            let read = response
                .read(&mut chunk)
                .map_err(|e| WeightsError::Network(format!("stream read failed: {e}")))?;
            if read == 0 {
                break;
            }

            payload.extend_from_slice(&chunk[..read]);
            if let Some(percent) = tracker.advance(read) {
                on_progress(percent);
            }
        }

        if let Some(expected) = content_length.filter(|&n| n != tracker.received()) {
            return Err(WeightsError::Network(format!(
                "stream ended after {} of {expected} bytes",
                tracker.received()
            )));
        }

        info!("📦 Received {} bytes", tracker.received());
        Ok(payload)
    }
}
