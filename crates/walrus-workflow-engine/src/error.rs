// Copyright (C) 2025 The Walrus Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for walrus-workflow-engine.

use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Definition generation or attribute validation failed.
    #[error(transparent)]
    Workflow(#[from] walrus_workflow::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A remote API (runner or Kubernetes) returned an error response.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Error message from the server
        message: String,
    },

    /// Entity or remote object was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic version guard failed; another run advanced the workflow.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Secret store operation failed.
    #[error("Secret error: {0}")]
    Secret(String),

    /// Token issuance failed.
    #[error("Token error: {0}")]
    Token(String),
}

impl Error {
    /// Whether this is a not-found condition, local or remote.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_)) || matches!(self, Error::Api { status: 404, .. })
    }

    /// Whether a remote object already exists.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_)) || matches!(self, Error::Api { status: 409, .. })
    }
}

/// Result type using the engine Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(
            Error::Api {
                status: 404,
                message: "gone".into()
            }
            .is_not_found()
        );
        assert!(
            !Error::Api {
                status: 500,
                message: "boom".into()
            }
            .is_not_found()
        );
    }

    #[test]
    fn test_library_errors_pass_through() {
        let err: Error = walrus_workflow::Error::UnknownStepType("webhook".into()).into();
        assert_eq!(err.to_string(), "unknown workflow step type: webhook");
    }
}
