//! Speaker manager: the orchestration layer.
//!
//! Owns the extractor handle and the store client, runs audio through
//! VAD-trim, extraction and vector search, and exposes the enrol /
//! identify / verify / list / delete / stats operations. Tenant
//! identifiers use empty strings for "no filter" at this boundary; the
//! store layer converts them to absent predicates.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::extractor::Extractor;
use crate::store::{SpeakerFilter, SpeakerInfo, VectorStore};
use crate::streaming::{StreamParams, StreamingIdentifier};
use crate::vad::SilenceFilter;

/// Result of an identification query.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyResult {
    pub identified: bool,
    pub speaker_id: String,
    pub speaker_name: String,
    pub confidence: f32,
    pub threshold: f32,
}

/// Result of a verification query.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub speaker_id: String,
    pub speaker_name: String,
    pub verified: bool,
    pub confidence: f32,
    pub threshold: f32,
}

/// Tenant-scoped database statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SpeakerStats {
    pub total_speakers: usize,
    pub total_samples: usize,
    pub embedding_dim: usize,
    pub threshold: f32,
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

/// Speaker recognition manager.
pub struct SpeakerManager {
    extractor: Extractor,
    store: VectorStore,
    silence_filter: Option<SilenceFilter>,
    threshold: f32,
}

impl SpeakerManager {
    /// Wires the manager from its collaborators. `silence_filter` is
    /// `None` when VAD trimming is disabled.
    pub fn new(
        extractor: Extractor,
        store: VectorStore,
        silence_filter: Option<SilenceFilter>,
        threshold: f32,
    ) -> Self {
        info!(
            dim = extractor.dim(),
            threshold,
            vad = silence_filter.is_some(),
            "speaker manager initialized"
        );
        Self {
            extractor,
            store,
            silence_filter,
            threshold,
        }
    }

    /// Embedding dimension declared by the extractor.
    pub fn embedding_dim(&self) -> usize {
        self.extractor.dim()
    }

    /// Default similarity cutoff.
    pub fn default_threshold(&self) -> f32 {
        self.threshold
    }

    /// The VAD trimmer, when configured. The register path trims with
    /// edge padding before enrolment; identify paths feed raw audio.
    pub fn silence_filter(&self) -> Option<&SilenceFilter> {
        self.silence_filter.as_ref()
    }

    /// The extractor handle. Exposed for accumulator accounting.
    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    /// A per-call threshold above zero overrides the default.
    fn resolve_threshold(&self, threshold: Option<f32>) -> f32 {
        match threshold {
            Some(t) if t > 0.0 => t,
            _ => self.threshold,
        }
    }

    /// Enrols one sample for a speaker. The audio is assumed pre-trimmed
    /// (the register handler trims with edges first).
    #[allow(clippy::too_many_arguments)]
    pub async fn register_speaker(
        &self,
        uid: &str,
        agent_id: &str,
        speaker_id: &str,
        speaker_name: &str,
        uuid: &str,
        audio: &[f32],
        sample_rate: u32,
    ) -> Result<()> {
        if uid.is_empty() {
            return Err(Error::missing("uid"));
        }
        if agent_id.is_empty() {
            return Err(Error::missing("agent_id"));
        }
        if uuid.is_empty() {
            return Err(Error::missing("uuid"));
        }

        let embedding = self.extractor.extract(audio, sample_rate)?;

        // The sample index continues the speaker's existing sequence; a
        // failed count query starts over at zero rather than failing the
        // enrolment.
        let sample_index = match self.store.sample_count(uid, agent_id, speaker_id).await {
            Ok(count) => count as u64,
            Err(e) => {
                debug!(error = %e, "sample count query failed, using index 0");
                0
            }
        };

        let now = Utc::now().timestamp();
        self.store
            .insert(
                uid,
                agent_id,
                speaker_id,
                speaker_name,
                uuid,
                embedding,
                sample_index,
                now,
                now,
            )
            .await?;

        info!(
            uid,
            agent_id,
            speaker_id,
            speaker_name,
            uuid,
            sample_index,
            "registered speaker sample"
        );
        Ok(())
    }

    /// Identifies the closest enrolled speaker within the given filters.
    /// Empty-string filters are unconstrained.
    #[allow(clippy::too_many_arguments)]
    pub async fn identify_speaker(
        &self,
        uid: &str,
        agent_id: &str,
        speaker_id: &str,
        speaker_name: &str,
        audio: &[f32],
        sample_rate: u32,
        threshold: Option<f32>,
    ) -> Result<IdentifyResult> {
        let threshold = self.resolve_threshold(threshold);
        let embedding = self.extractor.extract(audio, sample_rate)?;

        let filter = SpeakerFilter::optional(uid, agent_id, speaker_id, speaker_name);
        let matches = self.store.search(&filter, &embedding, threshold, 1).await?;

        let mut result = IdentifyResult {
            identified: false,
            speaker_id: String::new(),
            speaker_name: String::new(),
            confidence: 0.0,
            threshold,
        };
        if let Some(best) = matches.into_iter().next() {
            result.identified = true;
            result.speaker_id = best.speaker_id;
            result.speaker_name = best.speaker_name;
            result.confidence = best.confidence;
        }
        Ok(result)
    }

    /// Verifies an utterance against one specific speaker. Uses the
    /// manager's default threshold; per-call overrides apply to identify
    /// only.
    pub async fn verify_speaker(
        &self,
        uid: &str,
        agent_id: &str,
        speaker_id: &str,
        audio: &[f32],
        sample_rate: u32,
    ) -> Result<VerifyResult> {
        if uid.is_empty() {
            return Err(Error::missing("uid"));
        }

        let embedding = self.extractor.extract(audio, sample_rate)?;
        let filter = SpeakerFilter::speaker(uid, agent_id, speaker_id);
        let matches = self
            .store
            .search(&filter, &embedding, self.threshold, 1)
            .await?;

        let (verified, confidence, speaker_name) = match matches.first() {
            Some(best) => (true, best.confidence, best.speaker_name.clone()),
            None => {
                // Below threshold or not enrolled: recover the name so the
                // response stays meaningful, or report not-found.
                let info = self
                    .store
                    .speaker_info(uid, agent_id, speaker_id)
                    .await
                    .map_err(|_| Error::NotFound(format!("speaker {speaker_id}")))?;
                (false, 0.0, info.name)
            }
        };

        Ok(VerifyResult {
            speaker_id: speaker_id.to_string(),
            speaker_name,
            verified,
            confidence,
            threshold: self.threshold,
        })
    }

    /// All speakers enrolled under the tenant filter.
    pub async fn all_speakers(&self, uid: &str, agent_id: &str) -> Result<Vec<SpeakerInfo>> {
        self.store.all_speakers(uid, agent_id).await
    }

    /// Deletes every sample of a speaker. Absent speakers delete silently.
    pub async fn delete_speaker(&self, uid: &str, agent_id: &str, speaker_id: &str) -> Result<()> {
        if uid.is_empty() {
            return Err(Error::missing("uid"));
        }
        let deleted = self.store.delete_speaker(uid, agent_id, speaker_id).await?;
        info!(uid, agent_id, speaker_id, deleted, "deleted speaker");
        Ok(())
    }

    /// Deletes every sample carrying an enrolment UUID; not-found when the
    /// UUID matches nothing.
    pub async fn delete_speaker_by_uuid(
        &self,
        uid: &str,
        agent_id: &str,
        uuid: &str,
    ) -> Result<()> {
        if uid.is_empty() {
            return Err(Error::missing("uid"));
        }
        if uuid.is_empty() {
            return Err(Error::missing("uuid"));
        }
        let deleted = self.store.delete_by_uuid(uid, agent_id, uuid).await?;
        info!(uid, agent_id, uuid, deleted, "deleted speaker by uuid");
        Ok(())
    }

    /// Tenant-scoped statistics derived from the speaker list.
    pub async fn stats(&self, uid: &str, agent_id: &str) -> Result<SpeakerStats> {
        let speakers = self.store.all_speakers(uid, agent_id).await?;
        let total_samples = speakers.iter().map(|s| s.sample_count).sum();
        Ok(SpeakerStats {
            total_speakers: speakers.len(),
            total_samples,
            embedding_dim: self.extractor.dim(),
            threshold: self.threshold,
            version: env!("CARGO_PKG_VERSION").to_string(),
            updated_at: Utc::now(),
        })
    }

    /// Creates a streaming identification session. The transport discards
    /// finished sessions and calls this again for the next round.
    pub fn streaming(&self, params: StreamParams) -> StreamingIdentifier {
        StreamingIdentifier::new(
            &self.extractor,
            self.store.clone(),
            self.resolve_threshold(params.threshold),
            params,
        )
    }

    /// Releases the store connection. Sessions must be closed first; the
    /// extractor handle drops with the manager.
    pub async fn close(&self) -> Result<()> {
        let result = self.store.close().await;
        info!("speaker manager closed, all resources released");
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::extractor::EmbeddingModel;
    use crate::store::MemoryBackend;

    /// Deterministic model: the first sample selects a one-hot axis, so
    /// identical audio maps to the same embedding and test utterances with
    /// different seeds map to orthogonal ones.
    struct AxisModel {
        dim: usize,
    }

    impl EmbeddingModel for AxisModel {
        fn compute(&self, _sample_rate: u32, samples: &[f32]) -> Result<Vec<f32>> {
            let axis =
                (samples.first().copied().unwrap_or(0.0) * 100.0).round().abs() as usize % self.dim;
            let mut v = vec![0.0f32; self.dim];
            v[axis] = 1.0;
            Ok(v)
        }

        fn dim(&self) -> usize {
            self.dim
        }

        fn min_samples(&self, sample_rate: u32) -> usize {
            sample_rate as usize / 100
        }
    }

    async fn manager() -> SpeakerManager {
        let extractor = Extractor::new(Arc::new(AxisModel { dim: 16 }));
        let store = VectorStore::new(Arc::new(MemoryBackend::new()), "speakers", 16)
            .await
            .unwrap();
        SpeakerManager::new(extractor, store, None, 0.5)
    }

    /// 100 ms of tone whose first sample encodes the speaker seed, which
    /// the [`AxisModel`] turns into a distinct one-hot axis.
    fn utterance(seed: u32) -> Vec<f32> {
        let mut v: Vec<f32> = (0..1600).map(|i| ((i as f32) * 0.01).sin() * 0.5).collect();
        v[0] = seed as f32 / 100.0;
        v
    }

    #[tokio::test]
    async fn register_requires_tenant_fields() {
        let m = manager().await;
        let audio = utterance(1);
        let err = m
            .register_speaker("", "a1", "s1", "Alice", "U-1", &audio, 16000)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "uid is required");

        let err = m
            .register_speaker("u1", "", "s1", "Alice", "U-1", &audio, 16000)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "agent_id is required");

        let err = m
            .register_speaker("u1", "a1", "s1", "Alice", "", &audio, 16000)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "uuid is required");
    }

    #[tokio::test]
    async fn register_then_identify() {
        let m = manager().await;
        let audio = utterance(1);
        m.register_speaker("u1", "a1", "s1", "Alice", "U-1", &audio, 16000)
            .await
            .unwrap();

        let result = m
            .identify_speaker("u1", "a1", "", "", &audio, 16000, None)
            .await
            .unwrap();
        assert!(result.identified);
        assert_eq!(result.speaker_id, "s1");
        assert_eq!(result.speaker_name, "Alice");
        assert!(result.confidence >= m.default_threshold());
        assert_eq!(result.threshold, 0.5);
    }

    #[tokio::test]
    async fn identify_unknown_returns_unidentified() {
        let m = manager().await;
        m.register_speaker("u1", "a1", "s1", "Alice", "U-1", &utterance(1), 16000)
            .await
            .unwrap();

        let result = m
            .identify_speaker("u1", "a1", "", "", &utterance(2), 16000, None)
            .await
            .unwrap();
        assert!(!result.identified);
        assert!(result.speaker_id.is_empty());
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn per_call_threshold_overrides_default() {
        let m = manager().await;
        let result = m
            .identify_speaker("u1", "a1", "", "", &utterance(1), 16000, Some(0.9))
            .await
            .unwrap();
        assert_eq!(result.threshold, 0.9);

        // Zero and negative overrides fall back to the default.
        let result = m
            .identify_speaker("u1", "a1", "", "", &utterance(1), 16000, Some(0.0))
            .await
            .unwrap();
        assert_eq!(result.threshold, 0.5);
        let result = m
            .identify_speaker("u1", "a1", "", "", &utterance(1), 16000, Some(-1.0))
            .await
            .unwrap();
        assert_eq!(result.threshold, 0.5);
    }

    #[tokio::test]
    async fn verify_right_and_wrong_speaker() {
        let m = manager().await;
        let alice = utterance(1);
        let bob = utterance(2);
        m.register_speaker("u1", "a1", "s1", "Alice", "U-1", &alice, 16000)
            .await
            .unwrap();
        m.register_speaker("u1", "a1", "s2", "Bob", "U-2", &bob, 16000)
            .await
            .unwrap();

        let ok = m.verify_speaker("u1", "a1", "s1", &alice, 16000).await.unwrap();
        assert!(ok.verified);
        assert_eq!(ok.speaker_name, "Alice");
        assert!(ok.confidence >= 0.5);

        // Bob's voice against Alice's enrolment: rejected, but the name is
        // still recovered from the payload.
        let no = m.verify_speaker("u1", "a1", "s1", &bob, 16000).await.unwrap();
        assert!(!no.verified);
        assert_eq!(no.speaker_name, "Alice");
        assert!(no.confidence < 0.5);
    }

    #[tokio::test]
    async fn verify_unknown_speaker_not_found() {
        let m = manager().await;
        let err = m
            .verify_speaker("u1", "a1", "ghost", &utterance(1), 16000)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn sample_index_advances() {
        let m = manager().await;
        m.register_speaker("u1", "a1", "s1", "Alice", "U-1", &utterance(1), 16000)
            .await
            .unwrap();
        m.register_speaker("u1", "a1", "s1", "Alice", "U-1", &utterance(3), 16000)
            .await
            .unwrap();

        let speakers = m.all_speakers("u1", "a1").await.unwrap();
        assert_eq!(speakers.len(), 1);
        assert_eq!(speakers[0].sample_count, 2);
    }

    #[tokio::test]
    async fn stats_shape() {
        let m = manager().await;
        m.register_speaker("u1", "a1", "s1", "Alice", "U-1", &utterance(1), 16000)
            .await
            .unwrap();

        let stats = m.stats("u1", "a1").await.unwrap();
        assert_eq!(stats.total_speakers, 1);
        assert_eq!(stats.total_samples, 1);
        assert_eq!(stats.embedding_dim, 16);
        assert_eq!(stats.threshold, 0.5);
        assert!(!stats.version.is_empty());
    }

    #[tokio::test]
    async fn no_accumulator_leaks() {
        let m = manager().await;
        let audio = utterance(1);
        m.register_speaker("u1", "a1", "s1", "Alice", "U-1", &audio, 16000)
            .await
            .unwrap();
        m.identify_speaker("u1", "a1", "", "", &audio, 16000, None)
            .await
            .unwrap();
        m.verify_speaker("u1", "a1", "s1", &audio, 16000)
            .await
            .unwrap();
        // Insufficient-audio error path also releases.
        let _ = m
            .identify_speaker("u1", "a1", "", "", &[0.0; 4], 16000, None)
            .await;
        assert_eq!(m.extractor().live_streams(), 0);
    }
}
