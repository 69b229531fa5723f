//! voiceid-server - speaker recognition HTTP/WebSocket service.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voiceid::extractor::Extractor;
use voiceid::fbank::FbankConfig;
use voiceid::server;
use voiceid::store::{MemoryBackend, QdrantBackend, VectorBackend, VectorStore};
use voiceid::vad::{EnergyVad, SilenceFilter, SileroVad, VadEngine, VadPool};
use voiceid::{Config, OnnxEmbeddingModel, OnnxModelConfig, SpeakerManager};

/// Speaker recognition server.
#[derive(Parser, Debug)]
#[command(name = "voiceid-server")]
#[command(about = "Speaker recognition HTTP/WebSocket service")]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address override (e.g. 0.0.0.0:8080)
    #[arg(short, long)]
    listen: Option<String>,

    /// Use the in-memory vector store instead of Qdrant (data is lost on
    /// restart; for local development only)
    #[arg(long)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let mut cfg = Config::default();
            cfg.apply_env();
            cfg
        }
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }

    if !config.data_dir.is_empty() {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("failed to create data directory {}", config.data_dir))?;
    }

    // Embedding model behind the extractor handle.
    if config.model.model_path.is_empty() {
        anyhow::bail!("model.model_path is required");
    }
    let model = OnnxEmbeddingModel::load(
        &config.model.model_path,
        OnnxModelConfig {
            fbank: FbankConfig::default(),
            num_threads: config.model.num_threads,
            provider: config.model.provider.clone(),
            ..OnnxModelConfig::default()
        },
    )
    .context("failed to load embedding model")?;
    let extractor = Extractor::new(Arc::new(model));
    info!(dim = extractor.dim(), "embedding model loaded");

    // VAD pool: Silero when a model is configured, energy engine otherwise.
    let silence_filter = if config.vad.enabled {
        let vad_model_path = config.vad.model_path.clone();
        let timeout = Duration::from_secs(config.vad.acquire_timeout_secs);
        let pool = VadPool::new(config.vad.pool_size, timeout, || {
            if vad_model_path.is_empty() {
                Ok(Box::new(EnergyVad::new()) as Box<dyn VadEngine>)
            } else {
                Ok(Box::new(SileroVad::load(&vad_model_path)?) as Box<dyn VadEngine>)
            }
        })
        .context("failed to initialize VAD pool")?;
        info!(
            pool_size = config.vad.pool_size,
            engine = if config.vad.model_path.is_empty() {
                "energy"
            } else {
                "silero"
            },
            "VAD pool ready"
        );
        Some(SilenceFilter::new(Arc::new(pool), config.vad.hop_size))
    } else {
        None
    };

    // Vector store: Qdrant in production, in-memory for local development.
    let backend: Arc<dyn VectorBackend> = if args.memory_store {
        info!("using in-memory vector store");
        Arc::new(MemoryBackend::new())
    } else {
        let url = config.qdrant_url();
        info!(url = %url, "connecting to Qdrant");
        Arc::new(QdrantBackend::connect(&url)?)
    };
    let store = VectorStore::new(
        backend,
        config.vector_db.collection_name.clone(),
        extractor.dim(),
    )
    .await
    .context("failed to initialize vector store")?;

    let manager = Arc::new(SpeakerManager::new(
        extractor,
        store,
        silence_filter,
        config.threshold,
    ));

    let config = Arc::new(config);
    server::serve(manager.clone(), config)
        .await
        .context("server failed")?;

    manager.close().await?;
    info!("server stopped");
    Ok(())
}
