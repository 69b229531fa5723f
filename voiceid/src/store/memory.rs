//! In-memory [`VectorBackend`] using brute-force cosine similarity.
//!
//! Intended for testing and small-scale use. Mirrors the external store's
//! behaviour: vectors are L2-normalised on write and query, so the dot
//! product is the cosine similarity.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::{ScoredHit, SpeakerFilter, StoredPoint, VectorBackend, VectorPoint};

#[derive(Default)]
struct Collection {
    dim: usize,
    points: HashMap<u64, (Vec<f32>, super::PointPayload)>,
}

/// Brute-force in-memory vector store.
#[derive(Default)]
pub struct MemoryBackend {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of points in a collection. Test helper.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .expect("memory store lock")
            .get(collection)
            .map_or(0, |c| c.points.len())
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

fn normalized(v: &[f32]) -> Vec<f32> {
    let norm: f64 = v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    let scale = (1.0 / norm) as f32;
    v.iter().map(|&x| x * scale).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[async_trait]
impl VectorBackend for MemoryBackend {
    async fn ensure_collection(&self, collection: &str, dim: usize) -> Result<()> {
        let mut collections = self.collections.write().expect("memory store lock");
        collections
            .entry(collection.to_string())
            .or_insert_with(|| Collection {
                dim,
                points: HashMap::new(),
            });
        Ok(())
    }

    async fn upsert(&self, collection: &str, point: VectorPoint) -> Result<()> {
        let mut collections = self.collections.write().expect("memory store lock");
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| Error::Store(format!("collection {collection} does not exist")))?;
        if point.vector.len() != coll.dim {
            return Err(Error::Store(format!(
                "vector size {} does not match collection size {}",
                point.vector.len(),
                coll.dim
            )));
        }
        // Normalised on write, as the cosine-distance store does.
        coll.points
            .insert(point.id, (normalized(&point.vector), point.payload));
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &SpeakerFilter,
        limit: usize,
    ) -> Result<Vec<ScoredHit>> {
        let collections = self.collections.read().expect("memory store lock");
        let coll = collections
            .get(collection)
            .ok_or_else(|| Error::Store(format!("collection {collection} does not exist")))?;

        let query = normalized(vector);
        let mut hits: Vec<ScoredHit> = coll
            .points
            .values()
            .filter(|(_, payload)| filter.matches(payload))
            .map(|(stored, payload)| ScoredHit {
                score: dot(&query, stored),
                payload: payload.clone(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: &SpeakerFilter,
        limit: usize,
    ) -> Result<Vec<StoredPoint>> {
        let collections = self.collections.read().expect("memory store lock");
        let coll = collections
            .get(collection)
            .ok_or_else(|| Error::Store(format!("collection {collection} does not exist")))?;

        Ok(coll
            .points
            .iter()
            .filter(|(_, (_, payload))| filter.matches(payload))
            .take(limit)
            .map(|(&id, (_, payload))| StoredPoint {
                id,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn delete(&self, collection: &str, ids: &[u64]) -> Result<()> {
        let mut collections = self.collections.write().expect("memory store lock");
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| Error::Store(format!("collection {collection} does not exist")))?;
        for id in ids {
            coll.points.remove(id);
        }
        Ok(())
    }
}
