//! Embedding extraction.
//!
//! The neural model is an opaque operator behind [`EmbeddingModel`]:
//! mono f32 PCM in, fixed-dimension vector out. The [`Extractor`] owns the
//! model handle and hands out transient [`AudioStream`] accumulators, one
//! per utterance: feed waveform chunks, signal end-of-input, then compute.
//! Output vectors are not pre-normalised; normalisation belongs to the
//! vector store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Speaker embedding model contract.
///
/// Implementations must be safe for concurrent use; each call computes one
/// embedding from a complete utterance.
pub trait EmbeddingModel: Send + Sync {
    /// Computes an embedding from mono f32 PCM at the given sample rate.
    fn compute(&self, sample_rate: u32, samples: &[f32]) -> Result<Vec<f32>>;

    /// Dimensionality of the output vectors.
    fn dim(&self) -> usize;

    /// Minimum number of samples required before an embedding can be
    /// computed at the given sample rate.
    fn min_samples(&self, sample_rate: u32) -> usize;
}

/// Owns the model handle and creates per-utterance accumulators.
#[derive(Clone)]
pub struct Extractor {
    model: Arc<dyn EmbeddingModel>,
    live_streams: Arc<AtomicUsize>,
}

impl Extractor {
    pub fn new(model: Arc<dyn EmbeddingModel>) -> Self {
        Self {
            model,
            live_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Embedding dimensionality declared by the model.
    pub fn dim(&self) -> usize {
        self.model.dim()
    }

    /// Opens a fresh streaming accumulator for one utterance.
    pub fn open_stream(&self, sample_rate: u32) -> AudioStream {
        self.live_streams.fetch_add(1, Ordering::SeqCst);
        AudioStream {
            model: Arc::clone(&self.model),
            live_streams: Arc::clone(&self.live_streams),
            sample_rate,
            samples: Vec::new(),
            finished: false,
        }
    }

    /// One-shot extraction over a complete buffer.
    pub fn extract(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>> {
        let mut stream = self.open_stream(sample_rate);
        stream.accept_waveform(samples);
        stream.input_finished();
        stream.compute()
    }

    /// Number of accumulators currently alive. Used to detect leaks.
    pub fn live_streams(&self) -> usize {
        self.live_streams.load(Ordering::SeqCst)
    }
}

/// Transient audio accumulator for a single utterance.
///
/// Released when dropped; the owning [`Extractor`] tracks the live count.
pub struct AudioStream {
    model: Arc<dyn EmbeddingModel>,
    live_streams: Arc<AtomicUsize>,
    sample_rate: u32,
    samples: Vec<f32>,
    finished: bool,
}

impl AudioStream {
    /// Appends a chunk of waveform samples.
    pub fn accept_waveform(&mut self, samples: &[f32]) {
        self.samples.extend_from_slice(samples);
    }

    /// Marks end-of-input. Further chunks are still accepted but callers
    /// are expected to stop feeding after this.
    pub fn input_finished(&mut self) {
        self.finished = true;
    }

    /// True once end-of-input was signalled and enough audio accumulated.
    pub fn is_ready(&self) -> bool {
        self.finished && self.samples.len() >= self.model.min_samples(self.sample_rate)
    }

    /// Number of accumulated samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Computes the embedding. Fails with insufficient-audio when the
    /// stream is not ready.
    pub fn compute(&self) -> Result<Vec<f32>> {
        if !self.is_ready() {
            return Err(Error::InsufficientAudio);
        }
        let embedding = self.model.compute(self.sample_rate, &self.samples)?;
        if embedding.is_empty() {
            return Err(Error::Model("model returned an empty embedding".into()));
        }
        Ok(embedding)
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.live_streams.fetch_sub(1, Ordering::SeqCst);
    }
}
