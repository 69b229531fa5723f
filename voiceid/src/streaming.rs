//! Streaming identification sessions.
//!
//! One session covers one identification round: audio chunks accumulate
//! until the client signals `finish`, which computes the embedding, runs
//! the filtered search and finishes the session. The transport layer
//! discards finished sessions and creates fresh ones with the same
//! parameters for multi-round use over a single connection.

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::extractor::{AudioStream, Extractor};
use crate::manager::IdentifyResult;
use crate::store::{SpeakerFilter, VectorStore};

/// Session parameters. Empty strings leave the corresponding filter
/// dimension unconstrained; a non-positive threshold selects the default.
#[derive(Debug, Clone, Default)]
pub struct StreamParams {
    pub uid: String,
    pub agent_id: String,
    pub speaker_id: String,
    pub speaker_name: String,
    pub sample_rate: u32,
    pub threshold: Option<f32>,
}

struct SessionState {
    stream: Option<AudioStream>,
    finished: bool,
}

/// A single identification round over a streaming accumulator.
///
/// Operations are serialised by a session-local mutex, so `accept` cannot
/// race `finish`. The accumulator is released exactly once: `finish`
/// takes it out of the session on every path, success or error, and
/// `close` is an idempotent fallback.
pub struct StreamingIdentifier {
    store: VectorStore,
    params: StreamParams,
    threshold: f32,
    state: Mutex<SessionState>,
}

impl StreamingIdentifier {
    /// Opens a session with a fresh accumulator. Called through
    /// [`crate::manager::SpeakerManager::streaming`], which resolves the
    /// threshold first.
    pub(crate) fn new(
        extractor: &Extractor,
        store: VectorStore,
        threshold: f32,
        params: StreamParams,
    ) -> Self {
        let stream = extractor.open_stream(params.sample_rate);
        Self {
            store,
            params,
            threshold,
            state: Mutex::new(SessionState {
                stream: Some(stream),
                finished: false,
            }),
        }
    }

    /// Sample rate the session was opened with.
    pub fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    /// Resolved similarity threshold for this session.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Pushes a chunk of float samples into the accumulator.
    pub async fn accept(&self, samples: &[f32]) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.finished {
            return Err(Error::StreamFinished);
        }
        let stream = state.stream.as_mut().ok_or(Error::StreamFinished)?;
        stream.accept_waveform(samples);
        Ok(())
    }

    /// Ends input, computes the embedding and runs the filtered top-1
    /// search. The session transitions to finished regardless of outcome.
    pub async fn finish(&self) -> Result<IdentifyResult> {
        let mut state = self.state.lock().await;
        if state.finished {
            return Err(Error::StreamFinished);
        }
        state.finished = true;

        // Taking the accumulator out guarantees release on every path.
        let mut stream = state.stream.take().ok_or(Error::StreamFinished)?;
        stream.input_finished();
        if !stream.is_ready() {
            return Err(Error::InsufficientAudio);
        }
        let embedding = stream.compute()?;
        drop(stream);

        let filter = SpeakerFilter::optional(
            &self.params.uid,
            &self.params.agent_id,
            &self.params.speaker_id,
            &self.params.speaker_name,
        );
        let matches = self
            .store
            .search(&filter, &embedding, self.threshold, 1)
            .await?;
        debug!(matches = matches.len(), "streaming identification search");

        let mut result = IdentifyResult {
            identified: false,
            speaker_id: String::new(),
            speaker_name: String::new(),
            confidence: 0.0,
            threshold: self.threshold,
        };
        if let Some(best) = matches.into_iter().next() {
            result.identified = true;
            result.speaker_id = best.speaker_id;
            result.speaker_name = best.speaker_name;
            result.confidence = best.confidence;
        }
        Ok(result)
    }

    /// Releases the accumulator if still held. Safe to call repeatedly.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.finished = true;
        state.stream.take();
    }
}
