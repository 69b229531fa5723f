//! Qdrant [`VectorBackend`] over gRPC.
//!
//! The collection is created with cosine distance, so Qdrant normalises
//! vectors on write and scores queries with cosine similarity in
//! `[-1, 1]`.

use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, value::Kind, Condition, CreateCollectionBuilder,
    DeletePointsBuilder, Distance, Filter, PointId, PointStruct, PointsIdsList,
    QueryPointsBuilder, ScrollPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use tracing::info;

use crate::error::{Error, Result};

use super::{PointPayload, ScoredHit, SpeakerFilter, StoredPoint, VectorBackend, VectorPoint};

/// Qdrant-backed vector store.
pub struct QdrantBackend {
    client: Qdrant,
}

impl QdrantBackend {
    /// Connects to a Qdrant gRPC endpoint, e.g. `http://localhost:6334`.
    pub fn connect(url: &str) -> Result<Self> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| Error::Store(format!("failed to connect to Qdrant at {url}: {e}")))?;
        Ok(Self { client })
    }
}

/// Builds the Qdrant filter conjunction, omitting unconstrained
/// dimensions entirely. `None` means an unfiltered query.
fn build_filter(filter: &SpeakerFilter) -> Option<Filter> {
    let mut must = Vec::new();
    if let Some(uid) = &filter.uid {
        must.push(Condition::matches("uid", uid.clone()));
    }
    if let Some(agent_id) = &filter.agent_id {
        must.push(Condition::matches("agent_id", agent_id.clone()));
    }
    if let Some(speaker_id) = &filter.speaker_id {
        must.push(Condition::matches("speaker_id", speaker_id.clone()));
    }
    if let Some(speaker_name) = &filter.speaker_name {
        must.push(Condition::matches("speaker_name", speaker_name.clone()));
    }
    if let Some(uuid) = &filter.uuid {
        must.push(Condition::matches("uuid", uuid.clone()));
    }
    if must.is_empty() {
        None
    } else {
        Some(Filter::must(must))
    }
}

fn build_payload(p: &PointPayload) -> Payload {
    let mut payload = Payload::new();
    payload.insert("uid", p.uid.clone());
    payload.insert("agent_id", p.agent_id.clone());
    payload.insert("speaker_id", p.speaker_id.clone());
    payload.insert("speaker_name", p.speaker_name.clone());
    payload.insert("uuid", p.uuid.clone());
    payload.insert("sample_index", p.sample_index as i64);
    payload.insert("created_at", p.created_at);
    payload.insert("updated_at", p.updated_at);
    payload
}

fn payload_str(
    payload: &std::collections::HashMap<String, qdrant_client::qdrant::Value>,
    key: &str,
) -> String {
    match payload.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::StringValue(s)) => s.clone(),
        _ => String::new(),
    }
}

fn payload_i64(
    payload: &std::collections::HashMap<String, qdrant_client::qdrant::Value>,
    key: &str,
) -> i64 {
    match payload.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::IntegerValue(i)) => *i,
        _ => 0,
    }
}

fn parse_payload(
    payload: &std::collections::HashMap<String, qdrant_client::qdrant::Value>,
) -> PointPayload {
    PointPayload {
        uid: payload_str(payload, "uid"),
        agent_id: payload_str(payload, "agent_id"),
        speaker_id: payload_str(payload, "speaker_id"),
        speaker_name: payload_str(payload, "speaker_name"),
        uuid: payload_str(payload, "uuid"),
        sample_index: payload_i64(payload, "sample_index").max(0) as u64,
        created_at: payload_i64(payload, "created_at"),
        updated_at: payload_i64(payload, "updated_at"),
    }
}

fn numeric_id(id: Option<&PointId>) -> u64 {
    match id.and_then(|p| p.point_id_options.as_ref()) {
        Some(PointIdOptions::Num(n)) => *n,
        _ => 0,
    }
}

#[async_trait]
impl VectorBackend for QdrantBackend {
    async fn ensure_collection(&self, collection: &str, dim: usize) -> Result<()> {
        let exists = self
            .client
            .collection_exists(collection)
            .await
            .map_err(|e| Error::Store(format!("probe collection: {e}")))?;
        if exists {
            return Ok(());
        }

        info!(collection, dim, "collection does not exist, creating it");
        self.client
            .create_collection(
                CreateCollectionBuilder::new(collection)
                    .vectors_config(VectorParamsBuilder::new(dim as u64, Distance::Cosine)),
            )
            .await
            .map_err(|e| Error::Store(format!("create collection: {e}")))?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, point: VectorPoint) -> Result<()> {
        let payload = build_payload(&point.payload);
        let p = PointStruct::new(point.id, point.vector, payload);
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, vec![p]).wait(true))
            .await
            .map_err(|e| Error::Store(format!("upsert point: {e}")))?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &SpeakerFilter,
        limit: usize,
    ) -> Result<Vec<ScoredHit>> {
        let mut builder = QueryPointsBuilder::new(collection)
            .query(vector.to_vec())
            .limit(limit as u64)
            .with_payload(true);
        if let Some(f) = build_filter(filter) {
            builder = builder.filter(f);
        }

        let response = self
            .client
            .query(builder)
            .await
            .map_err(|e| Error::Store(format!("query points: {e}")))?;

        Ok(response
            .result
            .into_iter()
            .map(|point| ScoredHit {
                score: point.score,
                payload: parse_payload(&point.payload),
            })
            .collect())
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: &SpeakerFilter,
        limit: usize,
    ) -> Result<Vec<StoredPoint>> {
        let mut builder = ScrollPointsBuilder::new(collection)
            .limit(limit as u32)
            .with_payload(true);
        if let Some(f) = build_filter(filter) {
            builder = builder.filter(f);
        }

        let response = self
            .client
            .scroll(builder)
            .await
            .map_err(|e| Error::Store(format!("scroll points: {e}")))?;

        Ok(response
            .result
            .into_iter()
            .map(|point| StoredPoint {
                id: numeric_id(point.id.as_ref()),
                payload: parse_payload(&point.payload),
            })
            .collect())
    }

    async fn delete(&self, collection: &str, ids: &[u64]) -> Result<()> {
        let ids: Vec<PointId> = ids.iter().map(|&id| id.into()).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(PointsIdsList { ids })
                    .wait(true),
            )
            .await
            .map_err(|e| Error::Store(format!("delete points: {e}")))?;
        Ok(())
    }
}
