//! Silero VAD engine via ONNX Runtime.
//!
//! Silero is a stateful model: each 512-sample window at 16 kHz is
//! prefixed with a 64-sample context carried over from the previous
//! window, and a `[2, 1, 128]` hidden state threads through calls.
//! Frames shorter than the window are zero-padded; longer frames are
//! processed in sub-windows and reported as speech if any sub-window is.

use std::path::Path;

use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;

use crate::error::{Error, Result};

use super::VadEngine;

const SAMPLE_RATE: i64 = 16000;
const WINDOW_SIZE: usize = 512;
const CONTEXT_SIZE: usize = 64;
const STATE_SIZE: usize = 2 * 128;
const DEFAULT_THRESHOLD: f32 = 0.5;

/// Silero ONNX speech classifier.
pub struct SileroVad {
    session: Session,
    threshold: f32,
    state: Vec<f32>,
    context: Vec<f32>,
}

impl SileroVad {
    /// Loads the Silero model from `model_path` with the default 0.5
    /// probability threshold.
    pub fn load(model_path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_threshold(model_path, DEFAULT_THRESHOLD)
    }

    /// Loads the Silero model with a custom probability threshold.
    pub fn load_with_threshold(model_path: impl AsRef<Path>, threshold: f32) -> Result<Self> {
        let path = model_path.as_ref();
        if !path.exists() {
            return Err(Error::Vad(format!("VAD model not found: {}", path.display())));
        }
        let session = Session::builder()
            .map_err(|e| Error::Vad(format!("create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| Error::Vad(format!("set optimization level: {e}")))?
            .with_intra_threads(1)
            .map_err(|e| Error::Vad(format!("set threads: {e}")))?
            .commit_from_file(path)
            .map_err(|e| Error::Vad(format!("load VAD model: {e}")))?;

        Ok(Self {
            session,
            threshold,
            state: vec![0.0; STATE_SIZE],
            context: vec![0.0; CONTEXT_SIZE],
        })
    }

    /// Runs one 512-sample window through the model and returns the speech
    /// probability, updating hidden state and context.
    fn infer_window(&mut self, window: &[f32]) -> Result<f32> {
        debug_assert_eq!(window.len(), WINDOW_SIZE);

        let mut input = Vec::with_capacity(CONTEXT_SIZE + WINDOW_SIZE);
        input.extend_from_slice(&self.context);
        input.extend_from_slice(window);
        self.context.copy_from_slice(&window[WINDOW_SIZE - CONTEXT_SIZE..]);

        let input_tensor = Value::from_array(
            ndarray::Array2::from_shape_vec((1, CONTEXT_SIZE + WINDOW_SIZE), input)
                .map_err(|e| Error::Vad(format!("build input array: {e}")))?,
        )
        .map_err(|e| Error::Vad(format!("build input tensor: {e}")))?;

        let sr_tensor = Value::from_array(ndarray::Array::from_elem((), SAMPLE_RATE))
            .map_err(|e| Error::Vad(format!("build sr tensor: {e}")))?;

        let state_tensor = Value::from_array(
            ndarray::Array3::from_shape_vec((2, 1, 128), self.state.clone())
                .map_err(|e| Error::Vad(format!("build state array: {e}")))?,
        )
        .map_err(|e| Error::Vad(format!("build state tensor: {e}")))?;

        let outputs = self
            .session
            .run(ort::inputs![
                "input" => input_tensor,
                "sr" => sr_tensor,
                "state" => state_tensor,
            ])
            .map_err(|e| Error::Vad(format!("VAD inference failed: {e}")))?;

        let output = outputs
            .get("output")
            .ok_or_else(|| Error::Vad("missing 'output' tensor".into()))?;
        let (_, probs) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Vad(format!("extract output: {e}")))?;
        let probability = probs.first().copied().unwrap_or(0.0);

        let state_out = outputs
            .get("stateN")
            .ok_or_else(|| Error::Vad("missing 'stateN' tensor".into()))?;
        let (_, state) = state_out
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Vad(format!("extract state: {e}")))?;
        self.state = state.to_vec();

        Ok(probability)
    }
}

impl VadEngine for SileroVad {
    fn process(&mut self, frame: &[i16]) -> Result<bool> {
        if frame.is_empty() {
            return Ok(false);
        }

        let samples: Vec<f32> = frame.iter().map(|&s| s as f32 / 32768.0).collect();
        let mut speech = false;
        let mut window = vec![0.0f32; WINDOW_SIZE];

        for chunk in samples.chunks(WINDOW_SIZE) {
            window[..chunk.len()].copy_from_slice(chunk);
            window[chunk.len()..].fill(0.0);
            if self.infer_window(&window)? > self.threshold {
                speech = true;
            }
        }

        Ok(speech)
    }

    fn reset(&mut self) {
        self.state.fill(0.0);
        self.context.fill(0.0);
    }
}
