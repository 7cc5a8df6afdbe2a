//! # PCM Sample Conversions
//!
//! Helpers for moving between raw little-endian byte buffers, 16-bit samples
//! and 32-bit float samples. The upstream recognizer only accepts
//! 16kHz, 16-bit, mono, little-endian PCM.

use byteorder::{LittleEndian, WriteBytesExt};

/// Sample rate the recognizer expects.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Bytes per sample at 16-bit depth.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Encode samples as 16-bit little-endian bytes, no header.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Convert float samples in [-1.0, 1.0] to 16-bit PCM, clamping out-of-range values.
pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            let scaled = sample * 32768.0;
            scaled.clamp(-32768.0, 32767.0) as i16
        })
        .collect()
}

/// Average interleaved frames into one channel (integer mean).
pub fn downmix_to_mono(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }

    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Playback duration of 16kHz mono 16-bit PCM, in milliseconds.
pub fn duration_ms(byte_len: usize) -> u64 {
    (byte_len / BYTES_PER_SAMPLE) as u64 * 1000 / TARGET_SAMPLE_RATE as u64
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::BYTES_PER_SAMPLE;
    use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
    use std::io::Cursor;

    pub const FORMAT_PCM: u16 = 1;
    pub const FORMAT_IEEE_FLOAT: u16 = 3;

    /// Read 16-bit little-endian samples. A trailing odd byte is ignored.
    pub fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
        let mut cursor = Cursor::new(data);
        let mut samples = Vec::with_capacity(data.len() / BYTES_PER_SAMPLE);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }
        samples
    }

    /// Build a minimal 16-bit PCM WAV file in memory.
    pub fn wav_bytes(channels: u16, sample_rate: u32, samples: &[i16]) -> Vec<u8> {
        let mut data = Vec::new();
        for &sample in samples {
            data.write_i16::<LittleEndian>(sample).unwrap();
        }
        wav_file(FORMAT_PCM, channels, sample_rate, 16, &data)
    }

    /// Build a WAV file around already-encoded sample data.
    pub fn wav_file(format: u16, channels: u16, sample_rate: u32, bits: u16, data: &[u8]) -> Vec<u8> {
        let block_align = channels * bits / 8;
        let mut out = Vec::new();

        out.extend_from_slice(b"RIFF");
        out.write_u32::<LittleEndian>(36 + data.len() as u32).unwrap();
        out.extend_from_slice(b"WAVE");

        out.extend_from_slice(b"fmt ");
        out.write_u32::<LittleEndian>(16).unwrap();
        out.write_u16::<LittleEndian>(format).unwrap();
        out.write_u16::<LittleEndian>(channels).unwrap();
        out.write_u32::<LittleEndian>(sample_rate).unwrap();
        out.write_u32::<LittleEndian>(sample_rate * block_align as u32).unwrap();
        out.write_u16::<LittleEndian>(block_align).unwrap();
        out.write_u16::<LittleEndian>(bits).unwrap();

        out.extend_from_slice(b"data");
        out.write_u32::<LittleEndian>(data.len() as u32).unwrap();
        out.extend_from_slice(data);

        out
    }
}
