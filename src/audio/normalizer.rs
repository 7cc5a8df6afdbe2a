//! # Audio Normalization
//!
//! Turns whatever the client uploaded into 16kHz, 16-bit, mono, little-endian PCM.
//!
//! The normalizer walks an explicit, ordered chain of converters and takes the
//! first one that succeeds:
//!
//! 1. **Raw PCM**: declared `audio/pcm`-style content is already in shape.
//! 2. **Decoder**: symphonia + rubato (needs the `decode` feature).
//! 3. **WAV fallback**: header parsing with the `wav` crate; keeps the native rate.
//! 4. **External transcoder**: pipes non-WAV input through `ffmpeg`.
//!
//! A step that returns fewer than two bytes has produced no samples and counts
//! as a failure. When every step fails the original bytes are passed through
//! and the result is marked degraded. Normalization never fails a request.

use super::pcm::{downmix_to_mono, float_to_pcm, samples_to_bytes, TARGET_SAMPLE_RATE};
use std::io::{Cursor, ErrorKind, Write};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Content types that already mean raw 16-bit PCM.
const RAW_PCM_TYPES: &[&str] = &["audio/pcm", "audio/l16", "audio/x-pcm", "audio/raw", "audio/x-raw"];

/// An uploaded audio payload.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl AudioClip {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }

    /// Lowercased media type without parameters (`audio/L16; rate=16000` -> `audio/l16`).
    pub fn media_type(&self) -> String {
        self.content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }

    pub fn is_raw_pcm(&self) -> bool {
        RAW_PCM_TYPES.contains(&self.media_type().as_str())
    }

    /// RIFF/WAVE magic or a WAV content type.
    pub fn is_wav(&self) -> bool {
        let magic = self.bytes.len() >= 12 && &self.bytes[0..4] == b"RIFF" && &self.bytes[8..12] == b"WAVE";
        magic
            || matches!(
                self.media_type().as_str(),
                "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave"
            )
    }

    /// File extension to hint container probing.
    #[cfg(feature = "decode")]
    pub fn extension_hint(&self) -> Option<&'static str> {
        match self.media_type().as_str() {
            "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => Some("wav"),
            "audio/mpeg" | "audio/mp3" => Some("mp3"),
            "audio/ogg" | "audio/opus" => Some("ogg"),
            "audio/webm" => Some("webm"),
            "audio/flac" | "audio/x-flac" => Some("flac"),
            "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
            "audio/aac" => Some("aac"),
            _ => None,
        }
    }
}

/// Why one chain step did not produce PCM.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionError {
    /// The step does not handle this kind of input.
    Skipped(String),
    /// The step's facility is missing (feature off, binary not installed).
    Unavailable(String),
    /// The step tried and failed.
    Failed(String),
}

impl std::fmt::Display for ConversionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversionError::Skipped(msg) => write!(f, "skipped: {}", msg),
            ConversionError::Unavailable(msg) => write!(f, "unavailable: {}", msg),
            ConversionError::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

/// One step of the normalization chain. Runs on a blocking thread.
pub trait AudioConverter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce 16kHz mono 16-bit little-endian PCM.
    fn convert(&self, clip: &AudioClip) -> Result<Vec<u8>, ConversionError>;
}

/// Normalized audio plus how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedAudio {
    pub pcm: Vec<u8>,
    /// Name of the converter that produced `pcm`, or `passthrough`.
    pub converter: &'static str,
    /// True when the bytes are the unconverted upload.
    pub degraded: bool,
}

impl NormalizedAudio {
    pub fn passthrough(bytes: Vec<u8>) -> Self {
        Self {
            pcm: bytes,
            converter: "passthrough",
            degraded: true,
        }
    }
}

pub struct AudioNormalizer {
    chain: Vec<Box<dyn AudioConverter>>,
}

impl AudioNormalizer {
    /// The production chain.
    pub fn standard(transcoder_path: impl Into<String>) -> Self {
        Self::with_chain(vec![
            Box::new(RawPcmPassthrough),
            Box::new(super::decode::GeneralDecoder),
            Box::new(WavFallback),
            Box::new(ExternalTranscoder::new(transcoder_path)),
        ])
    }

    pub fn with_chain(chain: Vec<Box<dyn AudioConverter>>) -> Self {
        Self { chain }
    }

    pub fn converter_names(&self) -> Vec<&'static str> {
        self.chain.iter().map(|c| c.name()).collect()
    }

    pub fn normalize(&self, clip: &AudioClip) -> NormalizedAudio {
        for converter in &self.chain {
            match converter.convert(clip) {
                Ok(pcm) if pcm.len() < 2 => {
                    warn!(converter = converter.name(), "converter produced no samples, trying next");
                }
                Ok(mut pcm) => {
                    if pcm.len() % 2 != 0 {
                        pcm.truncate(pcm.len() - 1);
                    }
                    debug!(
                        converter = converter.name(),
                        input_bytes = clip.bytes.len(),
                        output_bytes = pcm.len(),
                        "audio normalized"
                    );
                    return NormalizedAudio {
                        pcm,
                        converter: converter.name(),
                        degraded: false,
                    };
                }
                Err(ConversionError::Skipped(reason)) => {
                    debug!(converter = converter.name(), %reason, "converter skipped");
                }
                Err(err) => {
                    warn!(converter = converter.name(), error = %err, "audio conversion failed, trying next");
                }
            }
        }

        warn!(
            content_type = %clip.content_type,
            bytes = clip.bytes.len(),
            "all audio conversions failed, sending original bytes"
        );
        NormalizedAudio::passthrough(clip.bytes.clone())
    }
}

/// Declared raw PCM is forwarded as-is.
pub struct RawPcmPassthrough;

impl AudioConverter for RawPcmPassthrough {
    fn name(&self) -> &'static str {
        "raw_pcm"
    }

    fn convert(&self, clip: &AudioClip) -> Result<Vec<u8>, ConversionError> {
        if clip.is_raw_pcm() {
            Ok(clip.bytes.clone())
        } else {
            Err(ConversionError::Skipped(format!("{} is not raw PCM", clip.media_type())))
        }
    }
}

/// Reads the WAV header directly. Downmixes to mono but cannot resample.
pub struct WavFallback;

impl AudioConverter for WavFallback {
    fn name(&self) -> &'static str {
        "wav"
    }

    fn convert(&self, clip: &AudioClip) -> Result<Vec<u8>, ConversionError> {
        if !clip.is_wav() {
            return Err(ConversionError::Skipped("not a WAV file".to_string()));
        }

        let mut cursor = Cursor::new(clip.bytes.as_slice());
        let (header, data) =
            wav::read(&mut cursor).map_err(|e| ConversionError::Failed(format!("invalid WAV: {}", e)))?;

        let samples: Vec<i16> = match data {
            wav::BitDepth::Eight(samples) => samples
                .into_iter()
                .map(|s| ((s as i16) - 128) << 8)
                .collect(),
            wav::BitDepth::Sixteen(samples) => samples,
            // 24-bit samples arrive in the top three bytes of the i32
            wav::BitDepth::TwentyFour(samples) => samples.into_iter().map(|s| (s >> 16) as i16).collect(),
            wav::BitDepth::ThirtyTwoFloat(samples) => float_to_pcm(&samples),
            wav::BitDepth::Empty => {
                return Err(ConversionError::Failed("WAV contains no samples".to_string()))
            }
        };

        let channels = header.channel_count.max(1) as usize;
        let mono = downmix_to_mono(&samples, channels);
        if mono.is_empty() {
            return Err(ConversionError::Failed("WAV contains no samples".to_string()));
        }

        if header.sampling_rate != TARGET_SAMPLE_RATE {
            warn!(
                sample_rate = header.sampling_rate,
                target = TARGET_SAMPLE_RATE,
                "WAV is not 16kHz and cannot be resampled here, recognition quality may suffer"
            );
        }

        Ok(samples_to_bytes(&mono))
    }
}

/// Pipes the upload through an external `ffmpeg` process.
pub struct ExternalTranscoder {
    program: String,
}

impl ExternalTranscoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl AudioConverter for ExternalTranscoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn convert(&self, clip: &AudioClip) -> Result<Vec<u8>, ConversionError> {
        if clip.is_wav() {
            return Err(ConversionError::Skipped("WAV input is handled by the WAV fallback".to_string()));
        }

        let mut child = Command::new(&self.program)
            .args([
                "-hide_banner", "-loglevel", "error", "-i", "pipe:0", "-f", "s16le", "-acodec",
                "pcm_s16le", "-ac", "1", "-ar", "16000", "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    ConversionError::Unavailable(format!("{} not found", self.program))
                }
                _ => ConversionError::Failed(format!("cannot start {}: {}", self.program, e)),
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConversionError::Failed("transcoder stdin unavailable".to_string()))?;

        // Feed stdin from its own thread so a full stdout pipe cannot deadlock us
        let input = clip.bytes.clone();
        let writer = std::thread::spawn(move || stdin.write_all(&input));

        let output = child
            .wait_with_output()
            .map_err(|e| ConversionError::Failed(format!("transcoder did not finish: {}", e)))?;

        match writer.join() {
            Ok(Err(e)) => debug!(error = %e, "transcoder closed stdin early"),
            Err(_) => debug!("transcoder stdin writer panicked"),
            Ok(Ok(())) => {}
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConversionError::Failed(format!(
                "transcoder exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        if output.stdout.is_empty() {
            return Err(ConversionError::Failed("transcoder produced no audio".to_string()));
        }

        info!(bytes = output.stdout.len(), "audio transcoded with {}", self.program);
        Ok(output.stdout)
    }
}
