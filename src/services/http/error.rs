//! Error responses for HTTP handlers.

use axum::http::StatusCode;
use serde::Serialize;

use super::request::HttpResponse;
use crate::auth::AuthError;
use crate::cluster::ClusterError;
use crate::collections::ManifestError;

/// Body of a field validation error, as the management API reports them.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub errors: serde_json::Map<String, serde_json::Value>,
}

/// Handler error that converts to an [`HttpResponse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    /// Form field the error refers to; rendered as `{"errors": {field: message}}`.
    pub field: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            field: None,
        }
    }

    /// A validation error on a specific form field.
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "")
    }

    pub fn forbidden(permission: impl std::fmt::Display) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            format!("Forbidden. User needs the following permissions: {}", permission),
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn into_response(self) -> HttpResponse {
        match self.field {
            Some(field) => {
                let mut errors = serde_json::Map::new();
                errors.insert(field, serde_json::Value::String(self.message));
                HttpResponse::json(self.status, &ErrorResponse { errors })
                    .unwrap_or_else(|_| HttpResponse::empty(self.status))
            }
            None if self.message.is_empty() => HttpResponse::empty(self.status),
            None => HttpResponse::text(self.status, self.message),
        }
    }
}

impl From<ManifestError> for ApiError {
    fn from(err: ManifestError) -> Self {
        match &err {
            ManifestError::ScopeNotFound(_) | ManifestError::CollectionNotFound(_, _) => {
                Self::not_found(err.to_string())
            }
            _ => Self::bad_request(err.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match &err {
            AuthError::UserNotFound(_) | AuthError::GroupNotFound(_) => Self::not_found(err.to_string()),
            _ => Self::bad_request(err.to_string()),
        }
    }
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        match &err {
            ClusterError::BucketNotFound(_) => Self::not_found(err.to_string()),
            ClusterError::BucketExists(_) => Self::field("name", err.to_string()),
            ClusterError::InvalidBucketName(_) => Self::field("name", err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_errors_render_as_json() {
        let res = ApiError::field("name", "Bucket with given name already exists").into_response();
        assert_eq!(res.status, StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_slice(res.body_bytes().unwrap()).unwrap();
        assert_eq!(body["errors"]["name"], "Bucket with given name already exists");
    }

    #[test]
    fn manifest_errors_map_to_statuses() {
        let err: ApiError = ManifestError::ScopeNotFound("s".to_string()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err: ApiError = ManifestError::ScopeExists("s".to_string()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
