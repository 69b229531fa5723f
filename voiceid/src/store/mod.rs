//! Tenant-scoped vector storage.
//!
//! [`VectorBackend`] is the contract for the external key/vector/payload
//! store: collection bootstrap, upsert, filtered cosine query, scroll and
//! delete-by-id. [`QdrantBackend`] talks to a real Qdrant instance over
//! gRPC; [`MemoryBackend`] is a brute-force in-memory implementation for
//! testing and small-scale use.
//!
//! [`VectorStore`] layers the service semantics on top: deterministic
//! point identity, empty-string filter omission, client-side query
//! normalisation, score clamping, per-speaker aggregation and the
//! delete-by-speaker / delete-by-uuid asymmetry.

mod memory;
mod qdrant;

pub use memory::MemoryBackend;
pub use qdrant::QdrantBackend;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Upper bound for scroll-based aggregation queries.
const SCROLL_LIMIT: usize = 10_000;

/// Full payload stored with every enrolment sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointPayload {
    pub uid: String,
    pub agent_id: String,
    pub speaker_id: String,
    pub speaker_name: String,
    pub uuid: String,
    pub sample_index: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A point to upsert: identity, vector, payload.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

/// A point returned by a scroll.
#[derive(Debug, Clone)]
pub struct StoredPoint {
    pub id: u64,
    pub payload: PointPayload,
}

/// A point returned by a similarity query, with its raw score.
#[derive(Debug, Clone)]
pub struct ScoredHit {
    pub score: f32,
    pub payload: PointPayload,
}

/// Equality predicates over payload dimensions. `None` means
/// "unconstrained": the predicate is omitted, never matched against the
/// empty string.
#[derive(Debug, Clone, Default)]
pub struct SpeakerFilter {
    pub uid: Option<String>,
    pub agent_id: Option<String>,
    pub speaker_id: Option<String>,
    pub speaker_name: Option<String>,
    pub uuid: Option<String>,
}

fn opt(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

impl SpeakerFilter {
    /// Filter over the optional identification dimensions; empty strings
    /// drop the corresponding predicate.
    pub fn optional(uid: &str, agent_id: &str, speaker_id: &str, speaker_name: &str) -> Self {
        Self {
            uid: opt(uid),
            agent_id: opt(agent_id),
            speaker_id: opt(speaker_id),
            speaker_name: opt(speaker_name),
            uuid: None,
        }
    }

    /// Strict per-speaker filter used by verification: `uid` and
    /// `speaker_id` always apply, `agent_id` when non-empty.
    pub fn speaker(uid: &str, agent_id: &str, speaker_id: &str) -> Self {
        Self {
            uid: Some(uid.to_string()),
            agent_id: opt(agent_id),
            speaker_id: Some(speaker_id.to_string()),
            speaker_name: None,
            uuid: None,
        }
    }

    /// Filter on a client-supplied enrolment UUID.
    pub fn by_uuid(uid: &str, agent_id: &str, uuid: &str) -> Self {
        Self {
            uid: Some(uid.to_string()),
            agent_id: opt(agent_id),
            speaker_id: None,
            speaker_name: None,
            uuid: Some(uuid.to_string()),
        }
    }

    /// True when no predicate applies.
    pub fn is_empty(&self) -> bool {
        self.uid.is_none()
            && self.agent_id.is_none()
            && self.speaker_id.is_none()
            && self.speaker_name.is_none()
            && self.uuid.is_none()
    }

    /// Evaluates the conjunction against a payload.
    pub fn matches(&self, p: &PointPayload) -> bool {
        fn ok(pred: &Option<String>, value: &str) -> bool {
            pred.as_deref().map_or(true, |v| v == value)
        }
        ok(&self.uid, &p.uid)
            && ok(&self.agent_id, &p.agent_id)
            && ok(&self.speaker_id, &p.speaker_id)
            && ok(&self.speaker_name, &p.speaker_name)
            && ok(&self.uuid, &p.uuid)
    }
}

/// External vector store contract.
///
/// Implementations must be safe for concurrent RPCs.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Creates the collection if it does not exist.
    async fn ensure_collection(&self, collection: &str, dim: usize) -> Result<()>;

    /// Adds or overwrites a point.
    async fn upsert(&self, collection: &str, point: VectorPoint) -> Result<()>;

    /// Cosine similarity query, best first. The filter conjunction always
    /// applies; scores are raw store scores.
    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &SpeakerFilter,
        limit: usize,
    ) -> Result<Vec<ScoredHit>>;

    /// Returns up to `limit` points matching the filter.
    async fn scroll(
        &self,
        collection: &str,
        filter: &SpeakerFilter,
        limit: usize,
    ) -> Result<Vec<StoredPoint>>;

    /// Deletes points by ID. Unknown IDs are ignored.
    async fn delete(&self, collection: &str, ids: &[u64]) -> Result<()>;

    /// Releases the connection. No-op for backends without one.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A single identification match after clamping and threshold filtering.
#[derive(Debug, Clone)]
pub struct SearchMatch {
    pub speaker_id: String,
    pub speaker_name: String,
    /// Cosine similarity in `[-1, 1]`.
    pub confidence: f32,
    /// `1 - confidence`.
    pub distance: f32,
    pub sample_index: u64,
}

/// Aggregated view of one enrolled speaker.
#[derive(Debug, Clone, Serialize)]
pub struct SpeakerInfo {
    pub id: String,
    pub name: String,
    pub uuid: String,
    pub agent_id: String,
    pub sample_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Typed client over a [`VectorBackend`].
#[derive(Clone)]
pub struct VectorStore {
    backend: Arc<dyn VectorBackend>,
    collection: String,
    dim: usize,
}

impl VectorStore {
    /// Connects the wrapper and bootstraps the collection.
    pub async fn new(
        backend: Arc<dyn VectorBackend>,
        collection: impl Into<String>,
        dim: usize,
    ) -> Result<Self> {
        let collection = collection.into();
        backend.ensure_collection(&collection, dim).await?;
        info!(collection = %collection, dim, "vector store ready");
        Ok(Self {
            backend,
            collection,
            dim,
        })
    }

    /// Embedding dimension of the collection.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Deterministic point identity: FNV-1a 64 over the composite key.
    /// Stable across deployments; changing it is a data migration.
    pub fn point_id(uid: &str, agent_id: &str, speaker_id: &str, sample_index: u64) -> u64 {
        fnv1a64(format!("{uid}:{agent_id}:{speaker_id}:{sample_index}").as_bytes())
    }

    /// Upserts one enrolment sample. The collection is re-checked first so
    /// an externally re-provisioned store heals on the next write.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        &self,
        uid: &str,
        agent_id: &str,
        speaker_id: &str,
        speaker_name: &str,
        uuid: &str,
        vector: Vec<f32>,
        sample_index: u64,
        created_at: i64,
        updated_at: i64,
    ) -> Result<()> {
        if vector.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }
        self.backend
            .ensure_collection(&self.collection, self.dim)
            .await?;

        let point = VectorPoint {
            id: Self::point_id(uid, agent_id, speaker_id, sample_index),
            vector,
            payload: PointPayload {
                uid: uid.to_string(),
                agent_id: agent_id.to_string(),
                speaker_id: speaker_id.to_string(),
                speaker_name: speaker_name.to_string(),
                uuid: uuid.to_string(),
                sample_index,
                created_at,
                updated_at,
            },
        };
        self.backend.upsert(&self.collection, point).await
    }

    /// Top-K cosine search above `threshold`. The query is L2-normalised
    /// client-side; scores are clamped to `[-1, 1]` and never rescaled.
    pub async fn search(
        &self,
        filter: &SpeakerFilter,
        vector: &[f32],
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<SearchMatch>> {
        let query = normalize(vector);
        let limit = top_k.max(1);
        let hits = self
            .backend
            .query(&self.collection, &query, filter, limit)
            .await?;

        let mut matches = Vec::with_capacity(hits.len());
        for hit in hits {
            let confidence = hit.score.clamp(-1.0, 1.0);
            if confidence < threshold {
                continue;
            }
            matches.push(SearchMatch {
                speaker_id: hit.payload.speaker_id,
                speaker_name: hit.payload.speaker_name,
                confidence,
                distance: 1.0 - confidence,
                sample_index: hit.payload.sample_index,
            });
        }
        debug!(
            matches = matches.len(),
            threshold, "vector search completed"
        );
        Ok(matches)
    }

    /// Number of enrolment samples for one speaker. Bounded scroll.
    pub async fn sample_count(&self, uid: &str, agent_id: &str, speaker_id: &str) -> Result<usize> {
        let filter = SpeakerFilter::speaker(uid, agent_id, speaker_id);
        let points = self
            .backend
            .scroll(&self.collection, &filter, SCROLL_LIMIT)
            .await?;
        Ok(points.len())
    }

    /// Aggregated info for one speaker, or not-found.
    pub async fn speaker_info(
        &self,
        uid: &str,
        agent_id: &str,
        speaker_id: &str,
    ) -> Result<SpeakerInfo> {
        let filter = SpeakerFilter::speaker(uid, agent_id, speaker_id);
        let points = self
            .backend
            .scroll(&self.collection, &filter, SCROLL_LIMIT)
            .await?;
        if points.is_empty() {
            return Err(Error::NotFound(format!("speaker {speaker_id}")));
        }
        Ok(aggregate(&points).remove(speaker_id).unwrap_or_else(|| {
            // Points matched the filter, so the aggregate always contains
            // the speaker; this arm is unreachable in practice.
            speaker_from_points(speaker_id, &points)
        }))
    }

    /// All speakers visible under the tenant filter, aggregated by
    /// `speaker_id` and sorted by ID.
    pub async fn all_speakers(&self, uid: &str, agent_id: &str) -> Result<Vec<SpeakerInfo>> {
        let filter = SpeakerFilter::optional(uid, agent_id, "", "");
        let points = self
            .backend
            .scroll(&self.collection, &filter, SCROLL_LIMIT)
            .await?;
        Ok(aggregate(&points).into_values().collect())
    }

    /// Deletes every sample of one speaker. Zero matches is a no-op.
    /// Returns the number of deleted points.
    pub async fn delete_speaker(
        &self,
        uid: &str,
        agent_id: &str,
        speaker_id: &str,
    ) -> Result<usize> {
        let filter = SpeakerFilter::speaker(uid, agent_id, speaker_id);
        self.delete_by_filter(&filter).await
    }

    /// Deletes every sample carrying the given enrolment UUID. Fails with
    /// not-found when nothing matches.
    pub async fn delete_by_uuid(&self, uid: &str, agent_id: &str, uuid: &str) -> Result<usize> {
        let filter = SpeakerFilter::by_uuid(uid, agent_id, uuid);
        let deleted = self.delete_by_filter(&filter).await?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("speaker with uuid {uuid}")));
        }
        Ok(deleted)
    }

    async fn delete_by_filter(&self, filter: &SpeakerFilter) -> Result<usize> {
        let points = self
            .backend
            .scroll(&self.collection, filter, SCROLL_LIMIT)
            .await?;
        if points.is_empty() {
            return Ok(0);
        }
        let ids: Vec<u64> = points.iter().map(|p| p.id).collect();
        self.backend.delete(&self.collection, &ids).await?;
        Ok(ids.len())
    }

    /// Releases the backend connection.
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}

/// Groups points by speaker, counting samples and reducing
/// `min(created_at)` / `max(updated_at)`.
fn aggregate(points: &[StoredPoint]) -> BTreeMap<String, SpeakerInfo> {
    let mut speakers: BTreeMap<String, SpeakerInfo> = BTreeMap::new();
    for point in points {
        let p = &point.payload;
        if p.speaker_id.is_empty() {
            continue;
        }
        let entry = speakers
            .entry(p.speaker_id.clone())
            .or_insert_with(|| SpeakerInfo {
                id: p.speaker_id.clone(),
                name: p.speaker_name.clone(),
                uuid: p.uuid.clone(),
                agent_id: p.agent_id.clone(),
                sample_count: 0,
                created_at: unix_time(p.created_at),
                updated_at: unix_time(p.updated_at),
            });
        entry.sample_count += 1;
        let created = unix_time(p.created_at);
        let updated = unix_time(p.updated_at);
        if p.created_at > 0 && created < entry.created_at {
            entry.created_at = created;
        }
        if p.updated_at > 0 && updated > entry.updated_at {
            entry.updated_at = updated;
        }
    }
    speakers
}

fn speaker_from_points(speaker_id: &str, points: &[StoredPoint]) -> SpeakerInfo {
    let p = &points[0].payload;
    SpeakerInfo {
        id: speaker_id.to_string(),
        name: p.speaker_name.clone(),
        uuid: p.uuid.clone(),
        agent_id: p.agent_id.clone(),
        sample_count: points.len(),
        created_at: unix_time(p.created_at),
        updated_at: unix_time(p.updated_at),
    }
}

fn unix_time(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// L2-normalises a query vector. Defensive against store configurations
/// that do not auto-normalise; normalising twice is harmless.
fn normalize(v: &[f32]) -> Vec<f32> {
    let norm: f64 = v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    let scale = (1.0 / norm) as f32;
    v.iter().map(|&x| x * scale).collect()
}

/// 64-bit FNV-1a. The constant choice is contractual: point IDs derived
/// with it identify existing data.
fn fnv1a64(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_vectors() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn point_id_deterministic() {
        let a = VectorStore::point_id("u1", "a1", "s1", 0);
        let b = VectorStore::point_id("u1", "a1", "s1", 0);
        assert_eq!(a, b);
        assert_ne!(a, VectorStore::point_id("u1", "a1", "s1", 1));
        assert_ne!(a, VectorStore::point_id("u2", "a1", "s1", 0));
        assert_ne!(a, VectorStore::point_id("u1", "a2", "s1", 0));
    }

    #[test]
    fn filter_omits_empty_dimensions() {
        let f = SpeakerFilter::optional("u1", "", "", "");
        assert!(f.agent_id.is_none());
        assert!(f.speaker_id.is_none());

        // Empty agent predicate must match any agent, not only "".
        let payload = PointPayload {
            uid: "u1".into(),
            agent_id: "a9".into(),
            speaker_id: "s1".into(),
            ..Default::default()
        };
        assert!(f.matches(&payload));

        let all_empty = SpeakerFilter::optional("", "", "", "");
        assert!(all_empty.is_empty());
        assert!(all_empty.matches(&payload));
    }

    #[test]
    fn strict_filter_keeps_required_dimensions() {
        let f = SpeakerFilter::speaker("u1", "", "s1");
        assert_eq!(f.uid.as_deref(), Some("u1"));
        assert!(f.agent_id.is_none());
        assert_eq!(f.speaker_id.as_deref(), Some("s1"));

        let other_uid = PointPayload {
            uid: "u2".into(),
            speaker_id: "s1".into(),
            ..Default::default()
        };
        assert!(!f.matches(&other_uid));
    }

    #[test]
    fn normalize_unit_length() {
        let v = normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        // Zero vectors pass through.
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn aggregate_reduces_timestamps() {
        let mk = |sid: &str, created: i64, updated: i64| StoredPoint {
            id: 1,
            payload: PointPayload {
                uid: "u1".into(),
                agent_id: "a1".into(),
                speaker_id: sid.into(),
                speaker_name: "Alice".into(),
                uuid: "U-1".into(),
                sample_index: 0,
                created_at: created,
                updated_at: updated,
            },
        };
        let points = vec![mk("s1", 100, 100), mk("s1", 50, 200), mk("s2", 10, 10)];
        let agg = aggregate(&points);
        assert_eq!(agg.len(), 2);

        let s1 = &agg["s1"];
        assert_eq!(s1.sample_count, 2);
        assert_eq!(s1.created_at.timestamp(), 50);
        assert_eq!(s1.updated_at.timestamp(), 200);
    }
}
