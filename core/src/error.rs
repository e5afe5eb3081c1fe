use serde::{Deserialize, Serialize};

/// Failure taxonomy shared by every stage. Transient kinds are retried at the
/// stage boundary; permanent kinds are dropped with an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    MalformedEvent,
    IndexUnavailable,
    EmbeddingTimeout,
    ClusterContention,
    GraphPartitionFailure,
    NotFound,
    InvalidArgument,
    Overloaded,
    Internal,
}

impl ErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::IndexUnavailable
                | ErrorKind::EmbeddingTimeout
                | ErrorKind::ClusterContention
                | ErrorKind::Overloaded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MalformedEvent => "MALFORMED_EVENT",
            ErrorKind::IndexUnavailable => "INDEX_UNAVAILABLE",
            ErrorKind::EmbeddingTimeout => "EMBEDDING_TIMEOUT",
            ErrorKind::ClusterContention => "CLUSTER_CONTENTION",
            ErrorKind::GraphPartitionFailure => "GRAPH_PARTITION_FAILURE",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::Overloaded => "OVERLOADED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub trait SentinelError: std::error::Error {
    fn error_kind(&self) -> ErrorKind;

    fn is_transient(&self) -> bool {
        self.error_kind().is_transient()
    }
}
