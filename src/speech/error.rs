//! # Gateway Error Types
//!
//! Everything that can go wrong between "audio arrived" and "transcript ready".
//! These errors never leave the gateway: [`crate::speech::SpeechGateway`] turns each
//! one into a [`crate::speech::RecognitionResult`] with `success: false`.
//!
//! There is no audio conversion variant. The normalizer degrades to
//! passing the original bytes through instead of failing, and a receive timeout
//! finishes the request with the partial transcript.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum SpeechError {
    /// One or more credential values are empty. Detected before any network I/O.
    Configuration,

    /// The connection could not be established or the handshake was rejected.
    /// `status` is the HTTP status of a rejected handshake, if there was one.
    Connection { status: Option<u16>, reason: String },

    /// The upstream sent an event with a non-zero code.
    Protocol { code: i64, message: String },

    /// An inbound message was not a valid event.
    MalformedEvent(String),

    /// The connection failed after it was established (closed early, I/O error).
    Transport(String),
}

impl SpeechError {
    /// Short machine-readable name, used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SpeechError::Configuration => "configuration",
            SpeechError::Connection { .. } => "connection",
            SpeechError::Protocol { .. } => "protocol",
            SpeechError::MalformedEvent(_) => "malformed_event",
            SpeechError::Transport(_) => "transport",
        }
    }
}

impl fmt::Display for SpeechError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeechError::Configuration => write!(
                f,
                "speech configuration incomplete (语音识别配置不完整): set XUNFEI_APP_ID, XUNFEI_API_KEY and XUNFEI_API_SECRET"
            ),
            SpeechError::Connection { status: Some(status), reason } => {
                write!(f, "cannot connect to speech service: {} - {}", status, reason)
            }
            SpeechError::Connection { status: None, reason } => {
                write!(f, "cannot connect to speech service: {}", reason)
            }
            SpeechError::Protocol { code, message } => {
                write!(f, "speech service error ({}): {}", code, message)
            }
            SpeechError::MalformedEvent(msg) => {
                write!(f, "unexpected message from speech service: {}", msg)
            }
            SpeechError::Transport(msg) => {
                write!(f, "connection to speech service closed unexpectedly: {}", msg)
            }
        }
    }
}

impl std::error::Error for SpeechError {}
