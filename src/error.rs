//! Error types for newsbalancer-core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using newsbalancer-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a terminal model-call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelErrorKind {
    /// Endpoint unreachable, timed out, or persistently 5xx
    Unavailable,
    /// Response body missing or structurally unusable
    InvalidOutput,
    /// 429 budget exhausted
    RateLimited,
    /// Credentials rejected
    Auth,
}

impl std::fmt::Display for ModelErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unavailable => "model_unavailable",
            Self::InvalidOutput => "model_invalid_output",
            Self::RateLimited => "model_rate_limited",
            Self::Auth => "model_auth",
        };
        write!(f, "{}", s)
    }
}

/// Errors that can occur during scoring operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Requested row does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Article URL collides with an existing row
    #[error("duplicate URL: {0}")]
    DuplicateUrl(String),

    /// Malformed input rejected by a store or aggregator contract
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Busy/locked storage condition worth retrying
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Non-transient storage failure
    #[error("database error: {0}")]
    Database(String),

    /// Terminal failure of a single model call
    #[error("model {model} failed ({kind}): {message}")]
    Model {
        model: String,
        kind: ModelErrorKind,
        message: String,
    },

    /// Operation exceeded its wall-clock budget
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Every deduplicated score failed the validity filter
    #[error("all perspectives returned invalid scores")]
    AllPerspectivesInvalid,

    /// Every surviving score has confidence at or below the threshold
    #[error("all perspective scores have zero confidence")]
    AllScoresZeroConfidence,

    /// Fewer usable perspectives than the configured minimum
    #[error("{valid} valid perspective(s) available, {required} required")]
    InsufficientPerspectives { valid: usize, required: usize },

    /// Sum of configured weights over the surviving scores is zero
    #[error("sum of perspective weights is zero")]
    AllWeightsZero,

    /// Scoring run was cancelled before reaching a verdict
    #[error("scoring run cancelled")]
    Cancelled,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a model-call error.
    pub fn model(
        model: impl Into<String>,
        kind: ModelErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Model {
            model: model.into(),
            kind,
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Whether the error is a transient storage condition that `with_retry`
    /// may resolve by waiting.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the error is one of the aggregator's terminal verdicts.
    pub fn is_aggregation_failure(&self) -> bool {
        matches!(
            self,
            Self::AllPerspectivesInvalid
                | Self::AllScoresZeroConfidence
                | Self::InsufficientPerspectives { .. }
                | Self::AllWeightsZero
        )
    }

    /// Stable snake_case code for progress payloads and logs.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::DuplicateUrl(_) => "conflict",
            Self::InvalidInput(_) => "invalid_input",
            Self::Transient(_) => "transient",
            Self::Database(_) => "database_error",
            Self::Model { kind, .. } => match kind {
                ModelErrorKind::Unavailable => "model_unavailable",
                ModelErrorKind::InvalidOutput => "model_invalid_output",
                ModelErrorKind::RateLimited => "model_rate_limited",
                ModelErrorKind::Auth => "model_auth",
            },
            Self::Timeout { .. } => "timeout",
            Self::AllPerspectivesInvalid => "all_perspectives_invalid",
            Self::AllScoresZeroConfidence => "all_scores_zero_confidence",
            Self::InsufficientPerspectives { .. } => "insufficient_perspectives",
            Self::AllWeightsZero => "all_weights_zero",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "invalid_input",
            Self::Serialization(_) => "invalid_input",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transient("database is locked".into()).is_transient());
        assert!(!Error::Database("disk I/O error".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn test_aggregation_failure_classification() {
        assert!(Error::AllPerspectivesInvalid.is_aggregation_failure());
        assert!(Error::AllScoresZeroConfidence.is_aggregation_failure());
        assert!(Error::InsufficientPerspectives {
            valid: 0,
            required: 1
        }
        .is_aggregation_failure());
        assert!(Error::AllWeightsZero.is_aggregation_failure());
        assert!(!Error::Cancelled.is_aggregation_failure());
        assert!(!Error::NotFound("article 7".into()).is_aggregation_failure());
    }

    #[test]
    fn test_wire_codes() {
        assert_eq!(
            Error::AllPerspectivesInvalid.wire_code(),
            "all_perspectives_invalid"
        );
        assert_eq!(Error::Cancelled.wire_code(), "cancelled");
        assert_eq!(Error::DuplicateUrl("u".into()).wire_code(), "conflict");
        assert_eq!(
            Error::model("left", ModelErrorKind::RateLimited, "429").wire_code(),
            "model_rate_limited"
        );
    }

    #[test]
    fn test_model_error_display() {
        let err = Error::model("right", ModelErrorKind::Unavailable, "connect refused");
        let rendered = err.to_string();
        assert!(rendered.contains("right"));
        assert!(rendered.contains("model_unavailable"));
        assert!(rendered.contains("connect refused"));
    }
}
