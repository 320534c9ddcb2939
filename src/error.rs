use std::io;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileServerError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Forbidden: {0}")]
    Forbidden(&'static str),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("File too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Malformed form data: {0}")]
    Multipart(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Template error: {0}")]
    Render(#[from] tera::Error),

    #[error("Archive stream aborted: {0}")]
    StreamingFailure(String),
}

impl FileServerError {
    /// Classify a failed `stat` of `path`.
    pub fn from_stat(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => {
                Self::NotFound(path.to_string())
            }
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            _ => Self::Io(err),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PermissionDenied(_) | Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::InvalidPath(_) | Self::Multipart(_) => StatusCode::BAD_REQUEST,
            Self::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Io(_) | Self::Zip(_) | Self::Render(_) | Self::StreamingFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Plain status-text response, e.g. `404 Not Found` with body `Not Found`.
pub fn status_response(status: StatusCode) -> Response {
    let text = status.canonical_reason().unwrap_or("Unknown Status");
    (status, text).into_response()
}

impl IntoResponse for FileServerError {
    fn into_response(self) -> Response {
        status_response(self.status_code())
    }
}
