//! # Speech Gateway Module
//!
//! Bridges an uploaded audio clip to the streaming speech recognizer and
//! returns a single [`RecognitionResult`].
//!
//! ## Pipeline:
//! ```text
//! caller ─▶ AudioNormalizer ─▶ sign URL ─▶ Connector ─▶ FrameStreamer ─▶ upstream
//!                                                                          │
//! caller ◀─ RecognitionResult ◀─ SpeechGateway ◀─ TranscriptAssembler ◀────┘
//! ```
//!
//! ## Key Components:
//! - **signer**: HMAC-SHA256 signed connection URL
//! - **protocol**: outbound frames and inbound event decoding
//! - **frames**: splits PCM into paced frames
//! - **transcript**: merges partial results into the final text
//! - **connection**: the network seam (`Connector` / `UpstreamConnection`)
//! - **gateway**: per-request lifecycle, timeouts and error translation

pub mod connection;
pub mod error;
pub mod frames;
pub mod gateway;
pub mod protocol;
pub mod signer;
pub mod transcript;

pub use connection::{Connector, WebSocketConnector};
pub use error::SpeechError;
pub use gateway::SpeechGateway;

use serde::Serialize;
use std::time::Duration;

/// Credentials issued by the recognizer. All three must be non-empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credential {
    pub app_id: String,
    pub api_key: String,
    pub api_secret: String,
}

impl Credential {
    pub fn is_complete(&self) -> bool {
        !self.app_id.is_empty() && !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

/// Where the recognizer lives.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub path: String,
}

impl Endpoint {
    /// `scheme://host/path` without query parameters.
    pub fn base_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.path)
    }
}

/// Session options sent once, as `business`, on the first frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionParameters {
    pub language: String,
    pub domain: String,
    pub accent: String,
    pub vad_eos: u32,
    pub dwa: String,
}

/// Everything one recognition needs, snapshotted from `AppConfig`.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub credential: Credential,
    pub endpoint: Endpoint,
    pub session: SessionParameters,
    pub frame_size: usize,
    pub frame_interval: Duration,
    pub connect_timeout: Duration,
    pub receive_timeout: Duration,
}

/// How a recognition ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionStatus {
    /// The upstream sent its final event.
    Completed,
    /// The receive wait expired; `text` holds what arrived before that.
    Partial,
    Failed,
}

/// The only value that crosses the gateway boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: RecognitionStatus,
    /// Failure category for metrics, never serialized.
    #[serde(skip)]
    pub error_kind: Option<&'static str>,
}

impl RecognitionResult {
    pub fn completed(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: Some(text.into()),
            error: None,
            status: RecognitionStatus::Completed,
            error_kind: None,
        }
    }

    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            status: RecognitionStatus::Partial,
            ..Self::completed(text)
        }
    }

    pub fn failed(err: &SpeechError) -> Self {
        let error = match err {
            SpeechError::Protocol { code, message } => format!("{}: {}", code, message),
            other => other.to_string(),
        };

        Self {
            success: false,
            text: None,
            error: Some(error),
            status: RecognitionStatus::Failed,
            error_kind: Some(err.kind()),
        }
    }
}
