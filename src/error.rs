//! Error taxonomy for the auto-coding pipeline.
//!
//! Embedding and clustering failures abort an `analyze()` call. Labeling
//! failures are caught per cluster inside [`crate::label`] and never surface
//! here. Empty input is not an error: see [`crate::models::Outcome`].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AutoCodingError>;

#[derive(Error, Debug)]
pub enum AutoCodingError {
    /// A required backend is missing or unreachable. Fatal, never retried.
    #[error("{component} unavailable: {reason} ({hint})")]
    DependencyUnavailable {
        component: String,
        reason: String,
        hint: String,
    },

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Clustering error: {0}")]
    Clustering(String),

    #[error("Labeling error: {0}")]
    Labeling(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Analysis cancelled")]
    Cancelled,
}

impl AutoCodingError {
    pub fn unavailable(
        component: impl Into<String>,
        reason: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        AutoCodingError::DependencyUnavailable {
            component: component.into(),
            reason: reason.into(),
            hint: hint.into(),
        }
    }

    /// True for errors the caller should present as an install/start hint.
    pub fn is_dependency_error(&self) -> bool {
        matches!(self, AutoCodingError::DependencyUnavailable { .. })
    }
}

impl From<reqwest::Error> for AutoCodingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AutoCodingError::Transport(format!("request timed out: {}", err))
        } else {
            AutoCodingError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AutoCodingError {
    fn from(err: serde_json::Error) -> Self {
        AutoCodingError::Transport(format!("invalid JSON payload: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_message_contains_hint() {
        let err = AutoCodingError::unavailable(
            "embedding",
            "Ollama not reachable",
            "start it with `ollama serve`",
        );
        assert!(err.is_dependency_error());
        let msg = err.to_string();
        assert!(msg.contains("embedding unavailable"));
        assert!(msg.contains("ollama serve"));
    }

    #[test]
    fn test_cancelled_is_not_dependency_error() {
        assert!(!AutoCodingError::Cancelled.is_dependency_error());
    }
}
