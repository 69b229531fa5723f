//! Error types for the speaker recognition service.

use thiserror::Error;

/// Result type alias for speaker recognition operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for speaker recognition operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed client input (required field, audio format, etc).
    #[error("{0}")]
    InvalidInput(String),

    /// The requested resource belongs to a different tenant.
    #[error("{0} belongs to different uid")]
    TenantMismatch(String),

    /// Speaker or enrolment not found.
    #[error("{0} not found")]
    NotFound(String),

    /// The accumulator holds too little audio to compute an embedding.
    #[error("insufficient audio data for embedding extraction")]
    InsufficientAudio,

    /// Operation on a streaming session that already finished.
    #[error("stream already finished")]
    StreamFinished,

    /// Embedding dimension does not match the collection dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Embedding model failure (load or inference).
    #[error("model error: {0}")]
    Model(String),

    /// VAD engine failure (load, classify, or pool exhaustion).
    #[error("vad error: {0}")]
    Vad(String),

    /// Vector store RPC failure.
    #[error("vector store error: {0}")]
    Store(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Reserved endpoint that is not implemented.
    #[error("{0} not implemented")]
    Unimplemented(&'static str),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Creates an `InvalidInput` error for a missing required field.
    pub fn missing(field: &str) -> Self {
        Error::InvalidInput(format!("{field} is required"))
    }

    /// Returns true if the error maps to a client-side 4xx status.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_) | Error::TenantMismatch(_) | Error::NotFound(_)
        )
    }

    /// Returns true if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages() {
        assert_eq!(Error::missing("uid").to_string(), "uid is required");
        assert_eq!(
            Error::NotFound("speaker s1".into()).to_string(),
            "speaker s1 not found"
        );
        assert_eq!(
            Error::StreamFinished.to_string(),
            "stream already finished"
        );
        assert_eq!(
            Error::DimensionMismatch {
                expected: 512,
                got: 256
            }
            .to_string(),
            "embedding dimension mismatch: expected 512, got 256"
        );
    }

    #[test]
    fn error_classification() {
        assert!(Error::missing("uid").is_client_error());
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(!Error::Store("rpc".into()).is_client_error());
    }
}
