//! [`EmbeddingModel`] implementation backed by ONNX Runtime.
//!
//! # Pipeline
//!
//! 1. Linear resample to the model rate when the source rate differs
//! 2. Log mel filterbank + CMVN ([`crate::fbank`])
//! 3. Segment-based inference: 300-frame windows with 150-frame hop
//! 4. Per-segment L2 normalisation, then averaging across segments
//!
//! Speaker embedding exports in the `feats -> embs` convention
//! (ERes2Net, CAM++ and friends) load as-is; other blob names are
//! configurable.

use std::path::Path;

use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::extractor::EmbeddingModel;
use crate::fbank::{cmvn, compute_fbank, l2_normalize, FbankConfig};

/// Fbank frames per inference segment (3 seconds at 10ms hop).
const SEG_FRAMES: usize = 300;

/// Hop between segments when averaging over long audio.
const HOP_FRAMES: usize = 150;

/// Configuration for [`OnnxEmbeddingModel`].
pub struct OnnxModelConfig {
    /// Expected embedding dimension (default: 512).
    pub dim: usize,
    /// Filterbank frontend parameters.
    pub fbank: FbankConfig,
    /// Model input blob name (default: "feats").
    pub input_name: String,
    /// Model output blob name (default: "embs").
    pub output_name: String,
    /// Intra-op thread count.
    pub num_threads: usize,
    /// Inference backend; only "cpu" is supported.
    pub provider: String,
}

impl Default for OnnxModelConfig {
    fn default() -> Self {
        Self {
            dim: 512,
            fbank: FbankConfig::default(),
            input_name: "feats".to_string(),
            output_name: "embs".to_string(),
            num_threads: 2,
            provider: "cpu".to_string(),
        }
    }
}

/// Speaker embedding model running through one ONNX Runtime session.
///
/// The session is shared behind a mutex; each extraction runs a handful of
/// segment inferences under it.
#[derive(Debug)]
pub struct OnnxEmbeddingModel {
    session: Mutex<Session>,
    dim: usize,
    fbank_cfg: FbankConfig,
    input_name: String,
    output_name: String,
}

impl OnnxEmbeddingModel {
    /// Loads the model from an ONNX file.
    pub fn load(model_path: impl AsRef<Path>, cfg: OnnxModelConfig) -> Result<Self> {
        let path = model_path.as_ref();
        if !path.exists() {
            return Err(Error::Model(format!(
                "embedding model not found: {}",
                path.display()
            )));
        }
        if !cfg.provider.is_empty() && cfg.provider != "cpu" {
            warn!(provider = %cfg.provider, "unsupported inference provider, using cpu");
        }

        let session = Session::builder()
            .map_err(|e| Error::Model(format!("create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| Error::Model(format!("set optimization level: {e}")))?
            .with_intra_threads(cfg.num_threads.max(1))
            .map_err(|e| Error::Model(format!("set threads: {e}")))?
            .commit_from_file(path)
            .map_err(|e| Error::Model(format!("load embedding model: {e}")))?;

        Ok(Self {
            session: Mutex::new(session),
            dim: cfg.dim,
            fbank_cfg: cfg.fbank,
            input_name: cfg.input_name,
            output_name: cfg.output_name,
        })
    }

    /// Runs inference over one fbank segment.
    fn infer_segment(&self, features: &[Vec<f32>]) -> Result<Vec<f32>> {
        let num_frames = features.len();
        let num_mels = features[0].len();

        let mut flat = Vec::with_capacity(num_frames * num_mels);
        for frame in features {
            flat.extend_from_slice(frame);
        }

        let input = Value::from_array(
            ndarray::Array3::from_shape_vec((1, num_frames, num_mels), flat)
                .map_err(|e| Error::Model(format!("build input array: {e}")))?,
        )
        .map_err(|e| Error::Model(format!("build input tensor: {e}")))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input])
            .map_err(|e| Error::Model(format!("inference failed: {e}")))?;

        let output = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| Error::Model(format!("missing '{}' tensor", self.output_name)))?;
        let (_, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Model(format!("extract output: {e}")))?;

        let n = data.len().min(self.dim);
        let mut embedding = vec![0.0f32; self.dim];
        embedding[..n].copy_from_slice(&data[..n]);
        Ok(embedding)
    }
}

impl EmbeddingModel for OnnxEmbeddingModel {
    fn compute(&self, sample_rate: u32, samples: &[f32]) -> Result<Vec<f32>> {
        let model_rate = self.fbank_cfg.sample_rate as u32;
        let resampled;
        let samples = if sample_rate != model_rate {
            resampled = resample_linear(samples, sample_rate, model_rate);
            &resampled[..]
        } else {
            samples
        };

        let mut features =
            compute_fbank(samples, &self.fbank_cfg).ok_or(Error::InsufficientAudio)?;
        if features.is_empty() {
            return Err(Error::InsufficientAudio);
        }
        cmvn(&mut features);

        let num_frames = features.len();
        if num_frames <= SEG_FRAMES {
            let mut emb = self.infer_segment(&features)?;
            l2_normalize(&mut emb);
            return Ok(emb);
        }

        // Long audio: sliding window, average all segment embeddings.
        let mut segments: Vec<Vec<f32>> = Vec::new();
        let mut start = 0;
        let mut last_start = 0;
        while start + SEG_FRAMES <= num_frames {
            let mut emb = self.infer_segment(&features[start..start + SEG_FRAMES])?;
            l2_normalize(&mut emb);
            segments.push(emb);
            last_start = start;
            start += HOP_FRAMES;
        }
        // Cover the tail when the hop grid stops short of the end.
        let tail = num_frames - SEG_FRAMES;
        if tail > last_start {
            let mut emb = self.infer_segment(&features[tail..])?;
            l2_normalize(&mut emb);
            segments.push(emb);
        }

        let mut avg = vec![0.0f32; self.dim];
        for seg in &segments {
            for (slot, &v) in avg.iter_mut().zip(seg.iter()) {
                *slot += v;
            }
        }
        let n = segments.len() as f32;
        for v in &mut avg {
            *v /= n;
        }
        Ok(avg)
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn min_samples(&self, sample_rate: u32) -> usize {
        // One fbank frame at the caller's rate.
        self.fbank_cfg.frame_length * sample_rate as usize / self.fbank_cfg.sample_rate
    }
}

/// Linear-interpolation resampler. Adequate as a model frontend; the
/// embedding is robust to the interpolation error.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples.get(idx + 1).copied().unwrap_or(a);
            a + (b - a) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let cfg = OnnxModelConfig::default();
        assert_eq!(cfg.dim, 512);
        assert_eq!(cfg.input_name, "feats");
        assert_eq!(cfg.output_name, "embs");
    }

    #[test]
    fn load_missing_model_fails() {
        let err =
            OnnxEmbeddingModel::load("/nonexistent/model.onnx", OnnxModelConfig::default())
                .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn resample_identity() {
        let samples = vec![0.1f32, 0.2, 0.3];
        assert_eq!(resample_linear(&samples, 16000, 16000), samples);
    }

    #[test]
    fn resample_halves_length() {
        let samples: Vec<f32> = (0..1000).map(|i| i as f32 / 1000.0).collect();
        let out = resample_linear(&samples, 32000, 16000);
        assert_eq!(out.len(), 500);
        // A linear ramp resamples onto itself.
        for (i, &v) in out.iter().enumerate() {
            let expected = (i * 2) as f32 / 1000.0;
            assert!((v - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn resample_doubles_length() {
        let samples: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let out = resample_linear(&samples, 8000, 16000);
        assert_eq!(out.len(), 200);
        assert!((out[1] - 0.5).abs() < 1e-4, "interpolated midpoint");
    }
}
