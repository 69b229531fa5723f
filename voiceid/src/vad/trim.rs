//! VAD-based silence trimming.
//!
//! Two flavours over a whole utterance: keep speech frames only (used to
//! drop silence aggressively), and keep everything from the first to the
//! last speech frame plus 100 ms of padding on each side (used at
//! enrolment, where natural onset/offset helps the embedding).

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;

use super::VadPool;

/// Edge padding retained around the speech region, in milliseconds.
const EDGE_MS: usize = 100;

/// Silence trimmer over a shared VAD pool.
///
/// Each operation checks out a single VAD instance for the whole pass, so
/// frame classifications share engine state and instances are never held
/// across utterances.
#[derive(Clone)]
pub struct SilenceFilter {
    pool: Arc<VadPool>,
    hop_size: usize,
}

/// One classified frame: sample range plus the speech decision.
struct FrameMark {
    start: usize,
    end: usize,
    is_speech: bool,
}

impl SilenceFilter {
    pub fn new(pool: Arc<VadPool>, hop_size: usize) -> Self {
        Self { pool, hop_size }
    }

    /// Removes silence frames, keeping speech frames verbatim and in order.
    ///
    /// A classification error on any frame fails the whole operation.
    pub async fn trim_speech(&self, audio: &[f32]) -> Result<Vec<f32>> {
        let frames = self.classify(audio).await?;
        let mut out = Vec::new();
        for frame in &frames {
            if frame.is_speech {
                out.extend_from_slice(&audio[frame.start..frame.end]);
            }
        }
        debug!(
            original = audio.len(),
            kept = out.len(),
            "vad trim: speech-only"
        );
        Ok(out)
    }

    /// Trims to the span from the first to the last speech frame, padded by
    /// 100 ms on each side (clipped to the buffer). Returns an empty buffer
    /// when no speech is found.
    pub async fn trim_speech_keep_edges(
        &self,
        audio: &[f32],
        sample_rate: u32,
    ) -> Result<Vec<f32>> {
        let frames = self.classify(audio).await?;

        let first = frames.iter().position(|f| f.is_speech);
        let last = frames.iter().rposition(|f| f.is_speech);
        let (first, last) = match (first, last) {
            (Some(f), Some(l)) => (f, l),
            _ => {
                debug!("vad trim: no speech detected, returning empty audio");
                return Ok(Vec::new());
            }
        };

        let edge_samples = (sample_rate as usize * EDGE_MS) / 1000;
        let start = frames[first].start.saturating_sub(edge_samples);
        let end = (frames[last].end + edge_samples).min(audio.len());

        debug!(
            original = audio.len(),
            kept = end - start,
            first_speech = frames[first].start,
            last_speech = frames[last].end,
            "vad trim: keep edges"
        );
        Ok(audio[start..end].to_vec())
    }

    /// Splits the buffer into hop-size frames (short tail included) and
    /// classifies each with one checked-out engine.
    async fn classify(&self, audio: &[f32]) -> Result<Vec<FrameMark>> {
        let mut vad = self.pool.acquire().await?;
        let mut frames = Vec::with_capacity(audio.len() / self.hop_size + 1);

        let mut start = 0;
        while start < audio.len() {
            let end = (start + self.hop_size).min(audio.len());
            let pcm = to_i16(&audio[start..end]);
            let is_speech = vad.process(&pcm)?;
            frames.push(FrameMark {
                start,
                end,
                is_speech,
            });
            start = end;
        }

        Ok(frames)
    }
}

/// Float samples to 16-bit PCM with saturation to `[-1, 1]`.
fn to_i16(frame: &[f32]) -> Vec<i16> {
    frame
        .iter()
        .map(|&f| {
            let v = f.clamp(-1.0, 1.0) * 32768.0;
            v.clamp(i16::MIN as f32, i16::MAX as f32) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::Error;
    use crate::vad::VadEngine;

    /// Flags a frame as speech when any sample magnitude exceeds 0.1.
    struct ThresholdVad;

    impl VadEngine for ThresholdVad {
        fn process(&mut self, frame: &[i16]) -> Result<bool> {
            Ok(frame.iter().any(|&s| s.unsigned_abs() > 3276))
        }
    }

    /// Fails on every frame.
    struct BrokenVad;

    impl VadEngine for BrokenVad {
        fn process(&mut self, _frame: &[i16]) -> Result<bool> {
            Err(Error::Vad("classifier failure".into()))
        }
    }

    fn filter_with<F>(factory: F) -> SilenceFilter
    where
        F: FnMut() -> Result<Box<dyn VadEngine>>,
    {
        let pool = VadPool::new(1, Duration::from_secs(1), factory).unwrap();
        SilenceFilter::new(Arc::new(pool), 160)
    }

    fn threshold_filter() -> SilenceFilter {
        filter_with(|| Ok(Box::new(ThresholdVad)))
    }

    /// 16 kHz buffer: `silence_ms` of silence, `speech_ms` of loud tone,
    /// `silence_ms` of silence again.
    fn speech_sandwich(silence_ms: usize, speech_ms: usize) -> Vec<f32> {
        let silence = vec![0.0f32; 16 * silence_ms];
        let speech: Vec<f32> = (0..16 * speech_ms)
            .map(|i| ((i as f32 * 0.2).sin()) * 0.8)
            .collect();
        let mut audio = silence.clone();
        audio.extend_from_slice(&speech);
        audio.extend_from_slice(&silence);
        audio
    }

    #[tokio::test]
    async fn trim_drops_silence_frames() {
        let filter = threshold_filter();
        let audio = speech_sandwich(200, 300);
        let trimmed = filter.trim_speech(&audio).await.unwrap();
        assert!(!trimmed.is_empty());
        assert!(trimmed.len() < audio.len());
        // Speech region is 300ms = 4800 samples; frame granularity may add
        // at most one hop on either side.
        assert!(trimmed.len() >= 4800);
        assert!(trimmed.len() <= 4800 + 2 * 160);
    }

    #[tokio::test]
    async fn trim_pure_silence_is_empty() {
        let filter = threshold_filter();
        let audio = vec![0.0f32; 16000];
        assert!(filter.trim_speech(&audio).await.unwrap().is_empty());
        assert!(filter
            .trim_speech_keep_edges(&audio, 16000)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn keep_edges_pads_100ms() {
        let filter = threshold_filter();
        let audio = speech_sandwich(500, 400);
        let trimmed = filter.trim_speech_keep_edges(&audio, 16000).await.unwrap();

        // Speech spans samples [8000, 14400); padding adds 1600 samples on
        // each side, modulo frame alignment (hop = 160).
        let expected = 6400 + 2 * 1600;
        assert!(trimmed.len() >= expected - 2 * 160);
        assert!(trimmed.len() <= expected + 2 * 160);
        assert!(trimmed.len() <= audio.len());
    }

    #[tokio::test]
    async fn keep_edges_clips_to_buffer() {
        let filter = threshold_filter();
        // Speech from the very first sample: padding cannot extend left.
        let audio: Vec<f32> = (0..3200).map(|i| ((i as f32 * 0.2).sin()) * 0.8).collect();
        let trimmed = filter.trim_speech_keep_edges(&audio, 16000).await.unwrap();
        assert_eq!(trimmed.len(), audio.len());
    }

    #[tokio::test]
    async fn short_tail_frame_is_classified() {
        let filter = threshold_filter();
        // 250 samples: one full 160 frame of silence plus a 90-sample loud
        // tail. The tail alone must be detected.
        let mut audio = vec![0.0f32; 160];
        audio.extend(std::iter::repeat(0.8).take(90));
        let trimmed = filter.trim_speech(&audio).await.unwrap();
        assert_eq!(trimmed.len(), 90);
    }

    #[tokio::test]
    async fn classification_error_fails_whole_operation() {
        let filter = filter_with(|| Ok(Box::new(BrokenVad)));
        let audio = vec![0.5f32; 1600];
        assert!(filter.trim_speech(&audio).await.is_err());
        assert!(filter.trim_speech_keep_edges(&audio, 16000).await.is_err());
        // The engine still returned to the pool.
        assert_eq!(filter.pool.available(), 1);
    }

    #[test]
    fn i16_conversion_saturates() {
        let pcm = to_i16(&[0.0, 0.5, -0.5, 2.0, -2.0, 1.0]);
        assert_eq!(pcm[0], 0);
        assert_eq!(pcm[1], 16384);
        assert_eq!(pcm[2], -16384);
        assert_eq!(pcm[3], i16::MAX);
        assert_eq!(pcm[4], i16::MIN);
        assert_eq!(pcm[5], i16::MAX);
    }
}
