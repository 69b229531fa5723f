//! Service configuration.
//!
//! Loaded from a JSON file, with defaults for every field so a minimal
//! config only names the embedding model. Qdrant connection settings can
//! be overridden through `QDRANT_HOST`, `QDRANT_PORT` and
//! `QDRANT_COLLECTION_NAME`.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub listen_addr: String,

    /// Embedding model settings.
    pub model: ModelConfig,

    /// Default cosine similarity cutoff for identify/verify.
    pub threshold: f32,

    /// Scratch directory for temporary files and audio dumps.
    /// Empty disables the dump sidecar.
    pub data_dir: String,

    /// Save every decoded utterance as a WAV file under `data_dir`.
    pub dump_audio: bool,

    /// VAD pool settings.
    pub vad: VadConfig,

    /// Vector database connection.
    pub vector_db: VectorDbConfig,

    /// HTTP/WebSocket server tuning.
    pub server: ServerConfig,

    /// Audio decoding settings.
    pub audio: AudioConfig,
}

/// Embedding model settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path to the speaker embedding ONNX model.
    pub model_path: String,
    /// Intra-op thread count for inference.
    pub num_threads: usize,
    /// Inference backend. Only "cpu" is handled; anything else logs a
    /// warning and falls back to CPU.
    pub provider: String,
}

/// VAD pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Disables silence trimming entirely when false.
    pub enabled: bool,
    /// Number of pre-initialised VAD instances.
    pub pool_size: usize,
    /// Frame length in samples fed to the classifier.
    pub hop_size: usize,
    /// Path to a Silero VAD ONNX model. Empty selects the energy engine.
    pub model_path: String,
    /// How long an acquire waits for a free instance before failing.
    pub acquire_timeout_secs: u64,
}

/// Vector database connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VectorDbConfig {
    pub host: String,
    pub port: u16,
    pub collection_name: String,
}

/// HTTP/WebSocket server tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub websocket: WebSocketConfig,
}

/// WebSocket tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Read deadline in seconds, refreshed on every inbound message.
    /// Zero disables the deadline.
    pub read_timeout_secs: u64,
    /// Maximum accepted frame size in bytes. Oversize frames are dropped
    /// with an error message; the connection stays open.
    pub max_message_size: usize,
}

/// Audio decoding settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Divisor applied to integer PCM samples to reach `[-1, 1]`.
    pub normalize_factor: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            model: ModelConfig::default(),
            threshold: 0.5,
            data_dir: String::new(),
            dump_audio: false,
            vad: VadConfig::default(),
            vector_db: VectorDbConfig::default(),
            server: ServerConfig::default(),
            audio: AudioConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            num_threads: 2,
            provider: "cpu".to_string(),
        }
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pool_size: 4,
            hop_size: 256,
            model_path: String::new(),
            acquire_timeout_secs: 10,
        }
    }
}

impl Default for VectorDbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6334,
            collection_name: "speaker_embeddings".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            websocket: WebSocketConfig::default(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: 300,
            max_message_size: 1 << 20,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            normalize_factor: 32768.0,
        }
    }
}

impl Config {
    /// Loads configuration from a JSON file and applies environment
    /// overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let mut cfg: Config = serde_json::from_slice(&data)
            .map_err(|e| Error::Config(format!("parse {}: {e}", path.as_ref().display())))?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Applies `QDRANT_*` environment overrides to the vector DB section.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("QDRANT_HOST") {
            if !host.is_empty() {
                self.vector_db.host = host;
            }
        }
        if let Ok(port) = std::env::var("QDRANT_PORT") {
            if let Ok(port) = port.parse() {
                self.vector_db.port = port;
            }
        }
        if let Ok(name) = std::env::var("QDRANT_COLLECTION_NAME") {
            if !name.is_empty() {
                self.vector_db.collection_name = name;
            }
        }
    }

    /// gRPC URL for the configured Qdrant instance.
    pub fn qdrant_url(&self) -> String {
        format!("http://{}:{}", self.vector_db.host, self.vector_db.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.vector_db.host, "localhost");
        assert_eq!(cfg.vector_db.port, 6334);
        assert_eq!(cfg.vector_db.collection_name, "speaker_embeddings");
        assert_eq!(cfg.audio.normalize_factor, 32768.0);
        assert_eq!(cfg.vad.hop_size, 256);
        assert!(cfg.vad.enabled);
    }

    #[test]
    fn parse_partial() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "threshold": 0.62,
                "model": {"model_path": "models/eres2net.onnx"},
                "vector_db": {"host": "qdrant.internal"}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.threshold, 0.62);
        assert_eq!(cfg.model.model_path, "models/eres2net.onnx");
        assert_eq!(cfg.vector_db.host, "qdrant.internal");
        // Unspecified fields fall back to defaults.
        assert_eq!(cfg.vector_db.port, 6334);
        assert_eq!(cfg.model.num_threads, 2);
    }

    #[test]
    fn qdrant_url_format() {
        let cfg = Config::default();
        assert_eq!(cfg.qdrant_url(), "http://localhost:6334");
    }
}
