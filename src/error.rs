// Library-level error type. The binary, CLI chat and web glue wrap these in
// anyhow with context, the same way the rest of the application reports errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("LLM is not configured")]
    NotConfigured,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to parse LLM output: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid identifier: {0:?}")]
    InvalidId(String),

    #[error("cannot {action} while {state}")]
    InvalidTransition { state: String, action: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display() {
        let e = Error::Api {
            status: 401,
            message: "invalid api key".to_string(),
        };
        assert_eq!(e.to_string(), "LLM API returned 401: invalid api key");
    }

    #[test]
    fn test_io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let e: Error = io_err.into();
        assert!(e.to_string().contains("file missing"));
    }

    #[test]
    fn test_invalid_transition_display() {
        let e = Error::InvalidTransition {
            state: "completed".to_string(),
            action: "confirm".to_string(),
        };
        assert_eq!(e.to_string(), "cannot confirm while completed");
    }
}
