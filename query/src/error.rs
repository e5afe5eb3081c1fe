use crate::params::ParamError;
use sentinel_core::error::{ErrorKind, SentinelError};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid parameters: {0}")]
    InvalidArgument(#[from] ParamError),
}

impl QueryError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl SentinelError for QueryError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            QueryError::NotFound { .. } => ErrorKind::NotFound,
            QueryError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }
}
