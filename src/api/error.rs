use std::path::Path;

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly; the body is the same envelope the
/// successful responses use, with `success: false`.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No authentication credentials provided.
    AuthRequired,
    /// 403 - Credentials provided but invalid.
    AuthInvalid,
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 400 - A path argument was not absolute.
    PathNotAbsolute(String),
    /// 404 - The target path does not exist.
    NotFound(String),
    /// 409 - The target path already exists.
    AlreadyExists(String),
    /// 403 - The agent lacks permission for the filesystem operation.
    PermissionDenied(String),
    /// 500 - Any other filesystem failure.
    Filesystem(String),
    /// 502 - The download request could not be completed.
    DownloadFailed(String),
    /// 502 - The download source answered with a non-200 status.
    UpstreamStatus(u16),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    /// Map an I/O error on `path` to the closest variant.
    pub fn io(path: &Path, e: std::io::Error) -> Self {
        let detail = format!("{}: {}", path.display(), e);
        match e.kind() {
            std::io::ErrorKind::NotFound => ApiError::NotFound(detail),
            std::io::ErrorKind::AlreadyExists => ApiError::AlreadyExists(detail),
            std::io::ErrorKind::PermissionDenied => ApiError::PermissionDenied(detail),
            _ => ApiError::Filesystem(detail),
        }
    }

    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PathNotAbsolute(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyExists(_) => StatusCode::CONFLICT,
            ApiError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ApiError::Filesystem(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::DownloadFailed(_) => StatusCode::BAD_GATEWAY,
            ApiError::UpstreamStatus(_) => StatusCode::BAD_GATEWAY,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::PathNotAbsolute(_) => "path_not_absolute",
            ApiError::NotFound(_) => "not_found",
            ApiError::AlreadyExists(_) => "already_exists",
            ApiError::PermissionDenied(_) => "permission_denied",
            ApiError::Filesystem(_) => "filesystem_error",
            ApiError::DownloadFailed(_) => "download_failed",
            ApiError::UpstreamStatus(_) => "upstream_status",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => "Authentication required.".to_string(),
            ApiError::AuthInvalid => "Invalid authentication token.".to_string(),
            ApiError::InvalidRequest(msg) => format!("Invalid request: {}", msg),
            ApiError::PathNotAbsolute(path) => format!("Path must be absolute: {}", path),
            ApiError::NotFound(detail) => format!("Not found: {}", detail),
            ApiError::AlreadyExists(detail) => format!("Already exists: {}", detail),
            ApiError::PermissionDenied(detail) => format!("Permission denied: {}", detail),
            ApiError::Filesystem(detail) => format!("Filesystem error: {}", detail),
            ApiError::DownloadFailed(detail) => format!("Download failed: {}", detail),
            ApiError::UpstreamStatus(status) => {
                format!("Download failed: server returned status {}", status)
            }
            ApiError::InternalError(msg) => format!("Internal error: {}", msg),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "success": false,
            "message": self.message(),
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}
