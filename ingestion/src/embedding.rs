use sentinel_core::embedding::{deterministic_embedding, EMBEDDING_DIMS};
use sentinel_core::error::{ErrorKind, SentinelError};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmbeddingError {
    #[error("embedding model unavailable: {0}")]
    Unavailable(String),
    #[error("embedding model rejected input: {0}")]
    Rejected(String),
}

impl SentinelError for EmbeddingError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            EmbeddingError::Unavailable(_) => ErrorKind::EmbeddingTimeout,
            EmbeddingError::Rejected(_) => ErrorKind::InvalidArgument,
        }
    }
}

/// Embedding model seam. Implementations must be deterministic for a fixed
/// `model_id`.
pub trait Embedder: Send + Sync {
    fn embed<'a>(
        &'a self,
        text: &'a str,
        model_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<f32>, EmbeddingError>>;

    fn dims(&self) -> usize;
}

pub struct DeterministicEmbedder {
    dims: usize,
}

impl DeterministicEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

impl Default for DeterministicEmbedder {
    fn default() -> Self {
        Self::new(EMBEDDING_DIMS)
    }
}

impl Embedder for DeterministicEmbedder {
    fn embed<'a>(
        &'a self,
        text: &'a str,
        model_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<f32>, EmbeddingError>> {
        let dims = self.dims;
        Box::pin(async move { Ok(deterministic_embedding(text, model_id, dims)) })
    }

    fn dims(&self) -> usize {
        self.dims
    }
}
