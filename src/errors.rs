use std::io;
use std::time::Duration;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("no document stored under `{key}`")]
    NotFound { key: String },
    #[error("malformed document: {0}")]
    Integrity(String),
    #[error("upstream returned {code}: {message}")]
    Upstream { code: String, message: String },
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl AppError {
    pub fn not_found(key: impl Into<String>) -> Self {
        AppError::NotFound { key: key.into() }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Io(_) | AppError::Http(_) | AppError::Timeout(_) | AppError::Upstream { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound { .. })
    }
}
