use crate::embedding::EmbeddingError;
use sentinel_core::error::{ErrorKind, SentinelError};
use storage::index::IndexError;
use storage::repo::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("embedding for post {post_id} timed out after {timeout_ms} ms")]
    EmbeddingTimeout { post_id: String, timeout_ms: u64 },
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl IngestionError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        IngestionError::Malformed(reason.into())
    }
}

impl SentinelError for IngestionError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            IngestionError::Malformed(_) => ErrorKind::MalformedEvent,
            IngestionError::EmbeddingTimeout { .. } => ErrorKind::EmbeddingTimeout,
            IngestionError::Embedding(e) => e.error_kind(),
            IngestionError::Index(e) => e.error_kind(),
            IngestionError::Store(e) => e.error_kind(),
        }
    }
}
