//! Pure aggregation of perspective scores into a composite.
//!
//! `aggregate` is deterministic: scores are grouped and summed in model-name
//! order, so identical inputs produce identical outputs across platforms.
//! Duplicate rows for a model are averaged rather than double-counted, which
//! keeps legacy data from skewing a rescore even though the store's unique
//! constraint prevents new duplicates.

use std::collections::BTreeMap;

use crate::config::{InvalidScorePolicy, ScoringConfig};
use crate::error::{Error, Result};
use crate::store::PerspectiveScore;

/// Successful aggregation outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Composite {
    /// Composite bias in [-1, 1]
    pub score: f64,
    /// Aggregate certainty in [0, 1]
    pub confidence: f64,
}

/// One model's contribution after deduplication.
#[derive(Debug, Clone, PartialEq)]
struct DedupedScore {
    model: String,
    score: f64,
    confidence: f64,
}

impl DedupedScore {
    fn is_valid(&self) -> bool {
        self.score.is_finite()
            && self.confidence.is_finite()
            && (-1.0..=1.0).contains(&self.score)
            && (0.0..=1.0).contains(&self.confidence)
    }
}

/// Replace duplicate rows per model with the arithmetic means of their
/// scores and confidences, ordered by model name.
fn deduplicate(scores: &[PerspectiveScore]) -> Vec<DedupedScore> {
    let mut groups: BTreeMap<&str, (f64, f64, u32)> = BTreeMap::new();
    for score in scores {
        let entry = groups.entry(score.model.as_str()).or_insert((0.0, 0.0, 0));
        entry.0 += score.score;
        entry.1 += score.confidence();
        entry.2 += 1;
    }

    groups
        .into_iter()
        .map(|(model, (score_sum, conf_sum, count))| DedupedScore {
            model: model.to_string(),
            score: score_sum / count as f64,
            confidence: conf_sum / count as f64,
        })
        .collect()
}

/// Aggregate a set of perspective scores under a configuration.
///
/// Returns the composite and aggregate confidence, or one of the terminal
/// aggregation errors:
///
/// - [`Error::AllPerspectivesInvalid`] — every deduplicated score failed the
///   validity filter and `handle_invalid` is `fail` (covers the empty input
///   set). Under `ignore`, invalid scores are dropped instead.
/// - [`Error::AllScoresZeroConfidence`] — at least one score was valid, but
///   none cleared the confidence threshold.
/// - [`Error::InsufficientPerspectives`] — fewer survivors than
///   `min_valid_perspectives`.
/// - [`Error::AllWeightsZero`] — the survivors' configured weights sum to
///   zero (models missing from the config weigh zero).
pub fn aggregate(scores: &[PerspectiveScore], cfg: &ScoringConfig) -> Result<Composite> {
    let deduped = deduplicate(scores);

    let valid: Vec<&DedupedScore> = deduped.iter().filter(|s| s.is_valid()).collect();
    if valid.is_empty() && cfg.handle_invalid == InvalidScorePolicy::Fail {
        return Err(Error::AllPerspectivesInvalid);
    }

    let surviving: Vec<&DedupedScore> = valid
        .iter()
        .copied()
        .filter(|s| s.confidence > cfg.confidence_threshold)
        .collect();
    if !valid.is_empty() && surviving.is_empty() {
        return Err(Error::AllScoresZeroConfidence);
    }

    if surviving.len() < cfg.min_valid_perspectives {
        return Err(Error::InsufficientPerspectives {
            valid: surviving.len(),
            required: cfg.min_valid_perspectives,
        });
    }

    let mut weight_sum = 0.0;
    let mut weighted_conf_sum = 0.0;
    let mut weighted_score_sum = 0.0;
    for s in &surviving {
        let weight = cfg.weight_for(&s.model).unwrap_or(0.0);
        weight_sum += weight;
        weighted_conf_sum += weight * s.confidence;
        weighted_score_sum += weight * s.confidence * s.score;
    }

    if weight_sum <= 0.0 || weighted_conf_sum <= 0.0 {
        return Err(Error::AllWeightsZero);
    }

    Ok(Composite {
        score: (weighted_score_sum / weighted_conf_sum).clamp(-1.0, 1.0),
        confidence: (weighted_conf_sum / weight_sum).clamp(0.0, 1.0),
    })
}
