//! # Audio Processing Module
//!
//! Prepares uploaded audio for the recognizer.
//!
//! ## Key Components:
//! - **PCM helpers** (`pcm`): sample/byte conversions, downmixing
//! - **Decoder** (`decode`): symphonia decoding + rubato resampling
//! - **Normalizer** (`normalizer`): ordered fallback chain that always yields bytes
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers, no header

pub mod decode;
pub mod normalizer;
pub mod pcm;

pub use normalizer::{AudioClip, AudioNormalizer, NormalizedAudio};
