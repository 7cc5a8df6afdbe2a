//! # General-Purpose Decoding
//!
//! Decodes any container/codec symphonia understands (WAV, MP3, FLAC, OGG/Vorbis,
//! MP4/AAC, ...), downmixes to mono and resamples to 16kHz with rubato.
//! Built only with the `decode` feature; without it the converter reports
//! itself unavailable and the normalizer moves on to its fallbacks.

use super::normalizer::{AudioClip, AudioConverter, ConversionError};

/// Chain step backed by symphonia + rubato.
pub struct GeneralDecoder;

impl AudioConverter for GeneralDecoder {
    fn name(&self) -> &'static str {
        "decoder"
    }

    #[cfg(feature = "decode")]
    fn convert(&self, clip: &AudioClip) -> Result<Vec<u8>, ConversionError> {
        use super::pcm::{float_to_pcm, samples_to_bytes, TARGET_SAMPLE_RATE};

        let (samples, sample_rate) = imp::decode_mono(&clip.bytes, clip.extension_hint())
            .map_err(ConversionError::Failed)?;
        let resampled = imp::resample(samples, sample_rate, TARGET_SAMPLE_RATE)
            .map_err(ConversionError::Failed)?;

        Ok(samples_to_bytes(&float_to_pcm(&resampled)))
    }

    #[cfg(not(feature = "decode"))]
    fn convert(&self, _clip: &AudioClip) -> Result<Vec<u8>, ConversionError> {
        Err(ConversionError::Unavailable(
            "built without the `decode` feature".to_string(),
        ))
    }
}

#[cfg(feature = "decode")]
mod imp {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };
    use std::io::Cursor;
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;
    use tracing::debug;

    /// Decode the first audio track to mono f32 samples. Returns the samples and their rate.
    pub fn decode_mono(bytes: &[u8], extension: Option<&str>) -> Result<(Vec<f32>, u32), String> {
        let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = extension {
            hint.with_extension(extension);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| format!("unrecognized container: {}", e))?;
        let mut format = probed.format;

        let (track_id, codec_params) = {
            let track = format
                .tracks()
                .iter()
                .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
                .ok_or_else(|| "no audio track".to_string())?;
            (track.id, track.codec_params.clone())
        };

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| format!("unsupported codec: {}", e))?;

        let mut sample_rate = codec_params.sample_rate;
        let mut mono = Vec::new();

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::ResetRequired) => break,
                Err(SymphoniaError::IoError(ref err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(err) => return Err(format!("packet read error: {}", err)),
            };

            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let signal_spec = *decoded.spec();
                    sample_rate.get_or_insert(signal_spec.rate);
                    let channels = signal_spec.channels.count().max(1);

                    let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, signal_spec);
                    buffer.copy_interleaved_ref(decoded);
                    mono.extend(
                        buffer
                            .samples()
                            .chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
                    );
                }
                Err(SymphoniaError::DecodeError(err)) => {
                    debug!(error = %err, "skipping undecodable packet");
                }
                Err(SymphoniaError::IoError(ref err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(err) => return Err(format!("decode error: {}", err)),
            }
        }

        if mono.is_empty() {
            return Err("no samples decoded".to_string());
        }

        let sample_rate = sample_rate.ok_or_else(|| "unknown sample rate".to_string())?;
        Ok((mono, sample_rate))
    }

    pub fn resample(samples: Vec<f32>, input_rate: u32, output_rate: u32) -> Result<Vec<f32>, String> {
        if input_rate == output_rate {
            return Ok(samples);
        }

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let mut resampler = SincFixedIn::<f32>::new(
            output_rate as f64 / input_rate as f64,
            2.0,
            params,
            samples.len(),
            1,
        )
        .map_err(|e| format!("resampler setup failed: {}", e))?;

        let output = resampler
            .process(&[samples], None)
            .map_err(|e| format!("resampling failed: {}", e))?;

        Ok(output.into_iter().next().unwrap_or_default())
    }
}

#[cfg(all(test, feature = "decode"))]
mod tests {
    use super::*;
    use crate::audio::pcm::test_support::bytes_to_samples;
    use crate::audio::pcm::test_support::wav_bytes;

    fn clip(bytes: Vec<u8>, content_type: &str) -> AudioClip {
        AudioClip::new(bytes, content_type)
    }

    #[test]
    fn test_decodes_16k_mono_wav_without_loss() {
        let samples: Vec<i16> = (0..1600).map(|i| ((i % 200) * 100 - 10_000) as i16).collect();
        let pcm = GeneralDecoder
            .convert(&clip(wav_bytes(1, 16_000, &samples), "audio/wav"))
            .unwrap();

        let decoded = bytes_to_samples(&pcm);
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in decoded.iter().zip(samples.iter()) {
            assert!((*a as i32 - *b as i32).abs() <= 1);
        }
    }

    #[test]
    fn test_resamples_and_downmixes() {
        // 0.5s of 8kHz stereo becomes roughly 0.5s of 16kHz mono
        let samples: Vec<i16> = (0..8000).map(|i| if i % 2 == 0 { 1000 } else { 3000 }).collect();
        let pcm = GeneralDecoder
            .convert(&clip(wav_bytes(2, 8_000, &samples), "audio/wav"))
            .unwrap();

        assert_eq!(pcm.len() % 2, 0);
        let frames = pcm.len() / 2;
        assert!(frames > 7_000 && frames < 9_000, "unexpected length {}", frames);
    }

    #[test]
    fn test_garbage_fails() {
        let result = GeneralDecoder.convert(&clip(vec![0x13; 4096], "audio/x-unknown"));
        assert!(matches!(result, Err(ConversionError::Failed(_))));
    }
}
