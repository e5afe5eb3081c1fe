use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use query::QueryError;
use sentinel_core::error::{ErrorKind, SentinelError};
use sentinel_sdk::EngineError;
use serde::Serialize;

/// Structured error body shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiError {
    pub error_kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_kind,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        status_for(self.error_kind)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::MalformedEvent | ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        kind if kind.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        Self::new(e.error_kind(), e.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self::new(e.error_kind(), e.to_string())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(ErrorKind::InvalidArgument, rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::new(ErrorKind::InvalidArgument, rejection.body_text())
    }
}

/// A body that is not a raw event is bad input, not a server fault.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(ErrorKind::MalformedEvent, rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_status_codes() {
        assert_eq!(status_for(ErrorKind::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::MalformedEvent), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Overloaded), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorKind::IndexUnavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(ErrorKind::GraphPartitionFailure),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status_for(ErrorKind::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn body_carries_kind_and_message() {
        let body = serde_json::to_value(ApiError::new(ErrorKind::NotFound, "narrative nar-9")).unwrap();
        assert_eq!(body["error_kind"], "NOT_FOUND");
        assert_eq!(body["message"], "narrative nar-9");
    }
}
