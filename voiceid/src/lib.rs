//! Multi-tenant speaker recognition service.
//!
//! Enrols voice prints (speaker embeddings) under a tenant namespace and
//! identifies or verifies unseen utterances against the enrolled
//! population. Audio arrives as complete WAV uploads over HTTP or as a
//! live stream of float32 PCM over WebSocket.
//!
//! # Pipeline
//!
//! ```text
//! audio bytes -> mono f32 PCM -> VAD trim (enrolment only)
//!             -> embedding extraction -> vector search / upsert -> result
//! ```
//!
//! # Architecture
//!
//! - [`vad`]: bounded pool of VAD engines plus silence trimming
//! - [`extractor`]: the opaque embedding model behind [`extractor::EmbeddingModel`],
//!   with per-utterance streaming accumulators
//! - [`store`]: tenant-scoped vector storage over Qdrant (or in-memory)
//! - [`manager`]: enrol / identify / verify / list / delete / stats
//! - [`streaming`]: per-round session state machine for WebSocket use
//! - [`server`]: axum HTTP + WebSocket transport
//!
//! Tenant isolation spans two dimensions, `uid` and `agent_id`; both are
//! required at enrolment and participate in every filtered query. Empty
//! strings mean "no filter" at the API boundary.

pub mod audio;
pub mod config;
pub mod error;
pub mod extractor;
pub mod fbank;
pub mod manager;
pub mod model_onnx;
pub mod server;
pub mod store;
pub mod streaming;
pub mod vad;

pub use config::Config;
pub use error::{Error, Result};
pub use extractor::{EmbeddingModel, Extractor};
pub use manager::{IdentifyResult, SpeakerManager, SpeakerStats, VerifyResult};
pub use model_onnx::{OnnxEmbeddingModel, OnnxModelConfig};
pub use store::{MemoryBackend, QdrantBackend, SpeakerInfo, VectorStore};
pub use streaming::{StreamParams, StreamingIdentifier};
pub use vad::{EnergyVad, SileroVad, SilenceFilter, VadPool};
