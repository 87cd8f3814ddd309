//! Domain types persisted by the score store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Scoring lifecycle status of an article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleStatus {
    /// Ingested, not yet scored
    Pending,
    /// A scoring run is in flight
    Processing,
    /// Composite score persisted
    Scored,
    /// Every perspective returned an invalid score
    FailedAllInvalid,
    /// Every perspective returned zero confidence
    FailedZeroConfidence,
    /// Run failed for another reason (insufficient perspectives, storage,
    /// cancellation)
    FailedError,
    /// Flagged for a human pass
    NeedsManualReview,
}

impl ArticleStatus {
    /// Stable storage/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Scored => "scored",
            Self::FailedAllInvalid => "failed_all_invalid",
            Self::FailedZeroConfidence => "failed_zero_confidence",
            Self::FailedError => "failed_error",
            Self::NeedsManualReview => "needs_manual_review",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "scored" => Some(Self::Scored),
            "failed_all_invalid" => Some(Self::FailedAllInvalid),
            "failed_zero_confidence" => Some(Self::FailedZeroConfidence),
            "failed_error" => Some(Self::FailedError),
            "needs_manual_review" => Some(Self::NeedsManualReview),
            _ => None,
        }
    }

    /// Whether this status ends a scoring lifecycle (rescoring may still
    /// re-enter from any terminal state).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Processing)
    }
}

impl std::fmt::Display for ArticleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A news article plus its scoring lifecycle fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub source: String,
    pub url: String,
    pub title: String,
    pub content: String,
    pub pub_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: ArticleStatus,
    pub fail_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Composite bias in [-1, 1]; set together with `confidence`
    pub composite_score: Option<f64>,
    /// Aggregate certainty in [0, 1]; set together with `composite_score`
    pub confidence: Option<f64>,
    /// Provenance of the composite, e.g. "llm"
    pub score_source: Option<String>,
}

/// Insert payload for an article produced by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewArticle {
    pub source: String,
    pub url: String,
    pub title: String,
    pub content: String,
    pub pub_date: DateTime<Utc>,
}

/// Metadata column of a perspective score.
///
/// `confidence` is required; everything else is opaque and survives a
/// round-trip through the store unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreMetadata {
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ScoreMetadata {
    pub fn new(confidence: f64) -> Self {
        Self {
            confidence,
            reasoning: None,
            extra: HashMap::new(),
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// A persisted per-model score. At most one row exists per
/// (article, model); rescoring replaces the row and bumps `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveScore {
    pub id: i64,
    pub article_id: i64,
    pub model: String,
    pub score: f64,
    pub metadata: ScoreMetadata,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl PerspectiveScore {
    /// Confidence carried in the metadata column.
    pub fn confidence(&self) -> f64 {
        self.metadata.confidence
    }
}

/// Upsert payload for a perspective score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPerspectiveScore {
    pub article_id: i64,
    pub model: String,
    pub score: f64,
    pub metadata: ScoreMetadata,
}

impl NewPerspectiveScore {
    pub fn new(article_id: i64, model: impl Into<String>, score: f64, confidence: f64) -> Self {
        Self {
            article_id,
            model: model.into(),
            score,
            metadata: ScoreMetadata::new(confidence),
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.metadata.reasoning = Some(reasoning.into());
        self
    }
}

/// Filter for article queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArticleFilter {
    pub status: Option<ArticleStatus>,
    pub source: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ArticleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: ArticleStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Opaque user feedback attached to an article. The core stores and returns
/// it without interpreting the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: i64,
    pub article_id: i64,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Current composite projection of an article, as read by API collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleResult {
    pub article_id: i64,
    pub composite_score: Option<f64>,
    pub confidence: Option<f64>,
    pub status: ArticleStatus,
    pub score_source: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ArticleStatus::Pending,
            ArticleStatus::Processing,
            ArticleStatus::Scored,
            ArticleStatus::FailedAllInvalid,
            ArticleStatus::FailedZeroConfidence,
            ArticleStatus::FailedError,
            ArticleStatus::NeedsManualReview,
        ] {
            assert_eq!(ArticleStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ArticleStatus::parse("nonsense"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!ArticleStatus::Pending.is_terminal());
        assert!(!ArticleStatus::Processing.is_terminal());
        assert!(ArticleStatus::Scored.is_terminal());
        assert!(ArticleStatus::FailedAllInvalid.is_terminal());
        assert!(ArticleStatus::FailedZeroConfidence.is_terminal());
        assert!(ArticleStatus::FailedError.is_terminal());
        assert!(ArticleStatus::NeedsManualReview.is_terminal());
    }

    #[test]
    fn test_metadata_preserves_extra_fields() {
        let raw = r#"{"confidence": 0.8, "reasoning": "leans left", "prompt_tokens": 412}"#;
        let meta: ScoreMetadata = serde_json::from_str(raw).unwrap();

        assert_eq!(meta.confidence, 0.8);
        assert_eq!(meta.reasoning.as_deref(), Some("leans left"));
        assert_eq!(meta.extra.get("prompt_tokens"), Some(&Value::from(412)));

        let rendered = serde_json::to_string(&meta).unwrap();
        let reparsed: ScoreMetadata = serde_json::from_str(&rendered).unwrap();
        assert_eq!(reparsed, meta);
    }

    #[test]
    fn test_filter_builder() {
        let filter = ArticleFilter::new()
            .with_status(ArticleStatus::Pending)
            .with_limit(10);

        assert_eq!(filter.status, Some(ArticleStatus::Pending));
        assert_eq!(filter.limit, Some(10));
        assert_eq!(filter.source, None);
    }
}
