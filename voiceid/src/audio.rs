//! Audio decoding for the two transport formats.
//!
//! HTTP uploads arrive as complete RIFF/WAV files (16-bit PCM, mono or
//! stereo). WebSocket binary frames carry raw little-endian IEEE-754
//! float32 samples in `[-1, 1]`. Both decode into mono `f32` PCM at the
//! source rate, which is what the rest of the pipeline consumes.

use std::io::Cursor;
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::error::{Error, Result};

/// Decodes a WAV file into mono f32 samples and its sample rate.
///
/// Stereo input is averaged down to mono. Integer samples are divided by
/// `normalize_factor` (32768 by default) to reach `[-1, 1]`.
pub fn decode_wav(data: &[u8], normalize_factor: f32) -> Result<(Vec<f32>, u32)> {
    let mut reader = WavReader::new(Cursor::new(data))
        .map_err(|e| Error::InvalidInput(format!("invalid WAV file: {e}")))?;
    let spec = reader.spec();

    if spec.channels == 0 || spec.channels > 2 {
        return Err(Error::InvalidInput(format!(
            "unsupported number of channels: {}",
            spec.channels
        )));
    }
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(Error::InvalidInput(format!(
            "only 16-bit PCM WAV is supported, got {}-bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }

    let mut samples = Vec::with_capacity(reader.len() as usize);
    for sample in reader.samples::<i16>() {
        let s = sample.map_err(|e| Error::InvalidInput(format!("failed to decode audio: {e}")))?;
        samples.push(s as f32 / normalize_factor);
    }

    if spec.channels == 2 {
        samples = samples
            .chunks_exact(2)
            .map(|pair| (pair[0] + pair[1]) / 2.0)
            .collect();
    }

    Ok((samples, spec.sample_rate))
}

/// Decodes a WebSocket binary frame of little-endian f32 samples.
///
/// The frame length must be a multiple of 4 bytes.
pub fn decode_f32_frames(data: &[u8]) -> Result<Vec<f32>> {
    if data.len() % 4 != 0 {
        return Err(Error::InvalidInput("invalid audio data length".to_string()));
    }
    Ok(data
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Writes mono f32 samples as a 16-bit PCM WAV file.
///
/// Debug sidecar only; nothing in the service contract depends on it.
pub fn write_wav(path: impl AsRef<Path>, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path.as_ref(), spec)
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
        writer
            .write_sample(v)
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    }
    writer
        .finalize()
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds an in-memory 16-bit PCM WAV from i16 samples.
    fn make_wav(samples: &[i16], channels: u16, sample_rate: u32) -> Vec<u8> {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut buf, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn decode_mono_wav() {
        let data = make_wav(&[0, 16384, -16384, 32767], 1, 16000);
        let (samples, sr) = decode_wav(&data, 32768.0).unwrap();
        assert_eq!(sr, 16000);
        assert_eq!(samples.len(), 4);
        assert!((samples[0] - 0.0).abs() < 1e-6);
        assert!((samples[1] - 0.5).abs() < 1e-6);
        assert!((samples[2] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn decode_stereo_averages_to_mono() {
        // L=16384, R=0 pairs average to 0.25.
        let data = make_wav(&[16384, 0, 16384, 0], 2, 44100);
        let (samples, sr) = decode_wav(&data, 32768.0).unwrap();
        assert_eq!(sr, 44100);
        assert_eq!(samples.len(), 2);
        for s in samples {
            assert!((s - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_wav(b"not a wav file", 32768.0).is_err());
    }

    #[test]
    fn decode_rejects_too_many_channels() {
        let spec = WavSpec {
            channels: 4,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut buf, spec).unwrap();
            for _ in 0..8 {
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        let err = decode_wav(&buf.into_inner(), 32768.0).unwrap_err();
        assert!(err.to_string().contains("unsupported number of channels"));
    }

    #[test]
    fn f32_frames_roundtrip() {
        let samples = [0.0f32, 0.5, -0.5, 1.0];
        let mut bytes = Vec::new();
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let decoded = decode_f32_frames(&bytes).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn f32_frames_reject_partial() {
        let err = decode_f32_frames(&[0, 0, 0]).unwrap_err();
        assert_eq!(err.to_string(), "invalid audio data length");
    }

    #[test]
    fn f32_frames_empty_ok() {
        assert!(decode_f32_frames(&[]).unwrap().is_empty());
    }

    #[test]
    fn wav_dump_roundtrip() {
        let dir = std::env::temp_dir().join("voiceid-audio-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dump.wav");

        let samples: Vec<f32> = (0..1600)
            .map(|i| (i as f32 * 0.01).sin() * 0.8)
            .collect();
        write_wav(&path, &samples, 16000).unwrap();

        let data = std::fs::read(&path).unwrap();
        let (decoded, sr) = decode_wav(&data, 32768.0).unwrap();
        assert_eq!(sr, 16000);
        assert_eq!(decoded.len(), samples.len());
        std::fs::remove_file(&path).ok();
    }
}
