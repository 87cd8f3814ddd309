//! Wire types for the model inference endpoint and the normalized response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, ModelErrorKind, Result};

/// Normalized response from one perspective model.
///
/// `score` is always in [-1, 1] and `confidence` in [0, 1] regardless of the
/// range the endpoint reported in. `raw` preserves the endpoint's reply for
/// the metadata column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResponse {
    pub score: f64,
    pub confidence: f64,
    pub reasoning: Option<String>,
    pub raw: Value,
}

/// Request body POSTed to a perspective model endpoint.
#[derive(Debug, Serialize)]
pub struct AnalyzeRequest<'a> {
    pub model: &'a str,
    pub perspective: &'a str,
    pub article_id: i64,
    pub content: &'a str,
}

/// Score range the endpoint reports in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreRange {
    /// Scores in [-1, 1]
    #[default]
    Signed,
    /// Scores in [0, 1], mapped through 2s - 1
    Unit,
}

/// Raw reply from a perspective model endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeReply {
    pub score: f64,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub range: Option<ScoreRange>,
}

impl AnalyzeReply {
    /// Normalize the reply into a [`ScoreResponse`].
    ///
    /// Unit-range scores map through `2s - 1`; confidences above 1 are
    /// treated as percentages; a missing confidence defaults to 0. Non-finite
    /// values are a model output defect, not something to clamp away.
    pub fn normalize(self, model: &str, raw: Value) -> Result<ScoreResponse> {
        if !self.score.is_finite() {
            return Err(Error::model(
                model,
                ModelErrorKind::InvalidOutput,
                format!("non-finite score: {}", self.score),
            ));
        }

        let score = match self.range.unwrap_or_default() {
            ScoreRange::Signed => self.score,
            ScoreRange::Unit => 2.0 * self.score - 1.0,
        };

        let confidence = match self.confidence {
            None => 0.0,
            Some(c) if !c.is_finite() => {
                return Err(Error::model(
                    model,
                    ModelErrorKind::InvalidOutput,
                    format!("non-finite confidence: {}", c),
                ));
            }
            Some(c) if c > 1.0 => c / 100.0,
            Some(c) => c,
        };

        Ok(ScoreResponse {
            score: score.clamp(-1.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: self.reasoning,
            raw,
        })
    }
}
