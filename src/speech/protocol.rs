//! # Upstream Wire Protocol
//!
//! JSON messages exchanged with the streaming recognizer. Outbound frames are
//! built from typed variants and inbound messages are decoded exactly once,
//! here, into [`InboundEvent`]. Nothing past this module looks at raw JSON.
//!
//! ## Outbound
//! ```json
//! {"common": {"app_id": "..."},
//!  "business": {"language": "zh_cn", "domain": "iat", "accent": "mandarin", "vad_eos": 5000, "dwa": "wpgs"},
//!  "data": {"status": 0, "format": "audio/L16;rate=16000", "audio": "<base64>", "encoding": "raw"}}
//! ```
//! Only the first frame carries `common` and `business`.
//!
//! ## Inbound
//! ```json
//! {"code": 0, "message": "success", "sid": "...",
//!  "data": {"status": 1, "result": {"pgs": "rpl", "ws": [{"bg": 0, "ed": 0, "cw": [{"w": "你好"}]}]}}}
//! ```

use super::error::SpeechError;
use super::transcript::{MergeMode, TranscriptSegment};
use super::SessionParameters;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Audio format announced on every frame.
pub const AUDIO_FORMAT: &str = "audio/L16;rate=16000";

/// Audio encoding announced on every frame.
pub const AUDIO_ENCODING: &str = "raw";

/// `data.status` value for the first frame, continuation frames and the last frame.
pub const STATUS_FIRST: u8 = 0;
pub const STATUS_CONTINUE: u8 = 1;
pub const STATUS_LAST: u8 = 2;

#[derive(Debug, Serialize)]
pub struct Common<'a> {
    pub app_id: &'a str,
}

#[derive(Debug, Serialize)]
pub struct AudioData {
    pub status: u8,
    pub format: &'static str,
    pub audio: String,
    pub encoding: &'static str,
}

impl AudioData {
    pub fn new(status: u8, chunk: &[u8]) -> Self {
        Self {
            status,
            format: AUDIO_FORMAT,
            audio: BASE64.encode(chunk),
            encoding: AUDIO_ENCODING,
        }
    }
}

/// One outbound text message.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame<'a> {
    /// Opens the session: credentials' app id and session parameters ride along.
    First {
        common: Common<'a>,
        business: &'a SessionParameters,
        data: AudioData,
    },
    /// Every later frame, including the last one.
    Continuation { data: AudioData },
}

impl OutboundFrame<'_> {
    pub fn to_json(&self) -> String {
        // Plain structs of strings and integers always serialize
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Non-zero `code`: the upstream rejected the session.
    Error { code: i64, message: String },
    /// A (possibly empty) batch of recognized segments.
    Result {
        segments: Vec<TranscriptSegment>,
        mode: MergeMode,
        is_final: bool,
    },
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<RawData>,
}

#[derive(Debug, Deserialize)]
struct RawData {
    #[serde(default)]
    status: i64,
    #[serde(default)]
    result: Option<RawResult>,
}

#[derive(Debug, Deserialize)]
struct RawResult {
    #[serde(default)]
    pgs: Option<String>,
    #[serde(default)]
    ws: Vec<RawWord>,
}

#[derive(Debug, Deserialize)]
struct RawWord {
    #[serde(default)]
    bg: i64,
    #[serde(default)]
    ed: i64,
    #[serde(default)]
    cw: Vec<RawCandidate>,
}

#[derive(Debug, Deserialize)]
struct RawCandidate {
    #[serde(default)]
    w: String,
}

/// Decode one inbound text message.
pub fn decode_event(text: &str) -> Result<InboundEvent, SpeechError> {
    let raw: RawEvent =
        serde_json::from_str(text).map_err(|e| SpeechError::MalformedEvent(e.to_string()))?;

    if raw.code != 0 {
        return Ok(InboundEvent::Error {
            code: raw.code,
            message: raw.message.unwrap_or_else(|| "unknown error".to_string()),
        });
    }

    let Some(data) = raw.data else {
        return Ok(InboundEvent::Result {
            segments: Vec::new(),
            mode: MergeMode::Append,
            is_final: false,
        });
    };

    let is_final = data.status == i64::from(STATUS_LAST);
    let (segments, mode) = match data.result {
        Some(result) => {
            let mode = match result.pgs.as_deref() {
                Some("rpl") => MergeMode::Replace,
                _ => MergeMode::Append,
            };
            let segments = result
                .ws
                .into_iter()
                .map(|word| TranscriptSegment {
                    begin_ms: word.bg,
                    end_ms: word.ed,
                    text: word.cw.into_iter().map(|c| c.w).collect(),
                })
                .collect();
            (segments, mode)
        }
        None => (Vec::new(), MergeMode::Append),
    };

    Ok(InboundEvent::Result {
        segments,
        mode,
        is_final,
    })
}
