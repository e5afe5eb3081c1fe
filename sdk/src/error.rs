use detection::{ClusterError, GraphError};
use ingestion::IngestionError;
use jobs::JobError;
use sentinel_core::error::{ErrorKind, SentinelError};
use storage::repo::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("engine already started")]
    AlreadyStarted,
    #[error(transparent)]
    Ingestion(#[from] IngestionError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] JobError),
}

impl SentinelError for EngineError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            EngineError::Config(_) => ErrorKind::InvalidArgument,
            EngineError::AlreadyStarted => ErrorKind::Internal,
            EngineError::Ingestion(e) => e.error_kind(),
            EngineError::Cluster(e) => e.error_kind(),
            EngineError::Graph(e) => e.error_kind(),
            EngineError::Store(e) => e.error_kind(),
            EngineError::Queue(e) => e.error_kind(),
        }
    }
}
