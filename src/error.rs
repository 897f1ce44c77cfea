use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::runtime::RuntimeError;

/// Agent-level error taxonomy. Every variant carries a human message and
/// maps to a stable wire `kind` plus a retryability hint.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("image registry unreachable: {0}")]
    RegistryUnreachable(String),

    #[error("registry authentication required: {0}")]
    AuthRequired(String),

    #[error("configuration not replicable: {0}")]
    ConfigNotReplicable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::RuntimeUnavailable(_) => "runtime_unavailable",
            AgentError::NotFound(_) => "not_found",
            AgentError::Conflict(_) => "conflict",
            AgentError::RegistryUnreachable(_) => "registry_unreachable",
            AgentError::AuthRequired(_) => "auth_required",
            AgentError::ConfigNotReplicable(_) => "config_not_replicable",
            AgentError::Timeout(_) => "timeout",
            AgentError::InvalidConfig(_) => "invalid_config",
            AgentError::Internal(_) => "internal",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            AgentError::RuntimeUnavailable(_)
                | AgentError::RegistryUnreachable(_)
                | AgentError::Timeout(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::Conflict(_) | AgentError::ConfigNotReplicable(_) => StatusCode::CONFLICT,
            AgentError::RuntimeUnavailable(_) | AgentError::RegistryUnreachable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AgentError::AuthRequired(_) => StatusCode::BAD_GATEWAY,
            AgentError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AgentError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            AgentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RuntimeError> for AgentError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(m) => AgentError::RuntimeUnavailable(m),
            RuntimeError::NotFound(m) => AgentError::NotFound(m),
            RuntimeError::RegistryUnreachable(m) => AgentError::RegistryUnreachable(m),
            RuntimeError::AuthRequired(m) => AgentError::AuthRequired(m),
            RuntimeError::Timeout(m) => AgentError::Timeout(m),
            RuntimeError::Other(m) => AgentError::Internal(m),
        }
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

/// JSON error body: `{ "error": { "kind", "message", "retryable" } }`.
#[derive(Serialize, utoipa::ToSchema)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        if matches!(self, AgentError::Internal(_)) {
            log::error!("internal error: {}", self);
        }
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind().to_string(),
                message: self.to_string(),
                retryable: self.retryable(),
            },
        };
        (self.status_code(), Json(body)).into_response()
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(AgentError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(AgentError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(
            AgentError::ConfigNotReplicable("x".into()).kind(),
            "config_not_replicable"
        );
    }

    #[test]
    fn retryability() {
        assert!(AgentError::RuntimeUnavailable("down".into()).retryable());
        assert!(AgentError::RegistryUnreachable("down".into()).retryable());
        assert!(AgentError::Timeout("slow".into()).retryable());
        assert!(!AgentError::AuthRequired("denied".into()).retryable());
        assert!(!AgentError::NotFound("gone".into()).retryable());
        assert!(!AgentError::InvalidConfig("bad".into()).retryable());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            AgentError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AgentError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AgentError::RuntimeUnavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AgentError::InvalidConfig("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn runtime_error_conversion() {
        let err: AgentError = RuntimeError::NotFound("c1".into()).into();
        assert_eq!(err.kind(), "not_found");

        let err: AgentError = RuntimeError::Unavailable("socket".into()).into();
        assert_eq!(err.kind(), "runtime_unavailable");
        assert!(err.retryable());
    }
}
