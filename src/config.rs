//! Scoring configuration: which perspective models to consult and how their
//! scores combine into a composite.
//!
//! The configuration is deserialized by the surrounding application (file
//! loading lives outside this crate) and validated here before an engine is
//! constructed. Validation is fail-fast: a duplicate model name or an
//! out-of-range field rejects the whole config.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Error, Result};

/// One configured perspective model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Stable model identifier, e.g. "left"
    pub name: String,
    /// Inference endpoint URL
    pub url: String,
    /// Human-readable viewpoint label, e.g. "progressive"
    pub perspective: String,
    /// Aggregation weight, >= 0
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl ModelConfig {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        perspective: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            perspective: perspective.into(),
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Aggregation formula.
///
/// `WeightedAverage` is the only shipped value; the enum is the extension
/// point for alternative formulas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Formula {
    #[default]
    WeightedAverage,
}

/// How the aggregator treats structurally invalid perspective scores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidScorePolicy {
    /// Drop invalid scores and aggregate the remainder
    #[default]
    Ignore,
    /// Fail the run when every score is invalid
    Fail,
}

/// Full scoring configuration consumed by the engine and aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Ordered list of perspective models to consult
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub formula: Formula,
    #[serde(default)]
    pub handle_invalid: InvalidScorePolicy,
    /// Scores with confidence at or below this value are filtered out
    #[serde(default)]
    pub confidence_threshold: f64,
    /// Minimum surviving perspectives required for a composite
    #[serde(default = "default_min_valid")]
    pub min_valid_perspectives: usize,
}

fn default_min_valid() -> usize {
    1
}

impl ScoringConfig {
    /// Create a config with defaults for everything but the model list.
    pub fn new(models: Vec<ModelConfig>) -> Self {
        Self {
            models,
            formula: Formula::default(),
            handle_invalid: InvalidScorePolicy::default(),
            confidence_threshold: 0.0,
            min_valid_perspectives: default_min_valid(),
        }
    }

    pub fn with_handle_invalid(mut self, policy: InvalidScorePolicy) -> Self {
        self.handle_invalid = policy;
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_min_valid_perspectives(mut self, min: usize) -> Self {
        self.min_valid_perspectives = min;
        self
    }

    /// Validate the configuration.
    ///
    /// Rejects an empty model list, duplicate model names, negative or
    /// non-finite weights, an out-of-range confidence threshold, and a zero
    /// minimum-perspective count.
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(Error::Config("no models configured".into()));
        }

        let mut seen = HashSet::new();
        for model in &self.models {
            if model.name.trim().is_empty() {
                return Err(Error::Config("model with empty name".into()));
            }
            if model.url.trim().is_empty() {
                return Err(Error::Config(format!("model {} has empty url", model.name)));
            }
            if !seen.insert(model.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate model in config: {}",
                    model.name
                )));
            }
            if !model.weight.is_finite() || model.weight < 0.0 {
                return Err(Error::Config(format!(
                    "model {} has invalid weight {}",
                    model.name, model.weight
                )));
            }
        }

        if !self.confidence_threshold.is_finite()
            || !(0.0..=1.0).contains(&self.confidence_threshold)
        {
            return Err(Error::Config(format!(
                "confidence_threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }

        if self.min_valid_perspectives == 0 {
            return Err(Error::Config(
                "min_valid_perspectives must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Configured weight for a model, if the model is part of this config.
    pub fn weight_for(&self, model: &str) -> Option<f64> {
        self.models.iter().find(|m| m.name == model).map(|m| m.weight)
    }

    /// Number of configured models.
    pub fn model_count(&self) -> usize {
        self.models.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn three_models() -> Vec<ModelConfig> {
        vec![
            ModelConfig::new("left", "http://inference/left", "progressive"),
            ModelConfig::new("center", "http://inference/center", "neutral"),
            ModelConfig::new("right", "http://inference/right", "conservative"),
        ]
    }

    #[test]
    fn test_valid_config() {
        let cfg = ScoringConfig::new(three_models());
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.weight_for("center"), Some(1.0));
        assert_eq!(cfg.weight_for("unknown"), None);
    }

    #[test]
    fn test_duplicate_model_rejected() {
        let mut models = three_models();
        models.push(ModelConfig::new("left", "http://inference/left2", "dup"));
        let cfg = ScoringConfig::new(models);

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate model"));
    }

    #[test]
    fn test_negative_weight_rejected() {
        let cfg = ScoringConfig::new(vec![
            ModelConfig::new("left", "http://inference/left", "progressive").with_weight(-0.5),
        ]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_all_zero_weights_pass_validation() {
        // Legal at load time; surfaces as AllWeightsZero during aggregation.
        let cfg = ScoringConfig::new(
            three_models()
                .into_iter()
                .map(|m| m.with_weight(0.0))
                .collect(),
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_threshold_range() {
        let cfg = ScoringConfig::new(three_models()).with_confidence_threshold(1.5);
        assert!(cfg.validate().is_err());

        let cfg = ScoringConfig::new(three_models()).with_confidence_threshold(0.2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_zero_min_perspectives_rejected() {
        let cfg = ScoringConfig::new(three_models()).with_min_valid_perspectives(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_deserialize_defaults() {
        let raw = r#"{
            "models": [
                {"name": "left", "url": "http://inference/left", "perspective": "progressive"}
            ]
        }"#;
        let cfg: ScoringConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(cfg.formula, Formula::WeightedAverage);
        assert_eq!(cfg.handle_invalid, InvalidScorePolicy::Ignore);
        assert_eq!(cfg.confidence_threshold, 0.0);
        assert_eq!(cfg.min_valid_perspectives, 1);
        assert_eq!(cfg.models[0].weight, 1.0);
    }

    #[test]
    fn test_handle_invalid_wire_form() {
        let raw = r#"{
            "models": [
                {"name": "left", "url": "http://inference/left", "perspective": "p"}
            ],
            "handle_invalid": "fail"
        }"#;
        let cfg: ScoringConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.handle_invalid, InvalidScorePolicy::Fail);
    }
}
