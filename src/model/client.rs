//! Perspective analyzer trait and the HTTP client implementation.

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::ModelConfig;
use crate::error::{Error, ModelErrorKind, Result};

use super::types::{AnalyzeReply, AnalyzeRequest, ScoreResponse};

/// Analyzer over the external inference endpoints. Implementations are
/// stateless and reentrant; one instance serves every concurrent run.
#[async_trait]
pub trait PerspectiveAnalyzer: Send + Sync {
    /// Score an article's content from one model's perspective.
    async fn analyze(
        &self,
        article_id: i64,
        content: &str,
        model: &ModelConfig,
    ) -> Result<ScoreResponse>;
}

/// Configuration for the HTTP analyzer.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Wall-clock timeout per HTTP call, in seconds
    pub timeout_secs: u64,
    /// Max retries after the first attempt
    pub max_retries: u32,
    /// Base delay used for exponential backoff
    pub base_delay_ms: u64,
    /// Backoff multiplier applied per retry attempt
    pub backoff_factor: f64,
    /// Upper bound of the uniform jitter added to each delay
    pub max_jitter_ms: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            base_delay_ms: 200,
            backoff_factor: 2.0,
            max_jitter_ms: 100,
        }
    }
}

impl AnalyzerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt as i32);
        let millis = (self.base_delay_ms as f64 * factor).round().max(0.0) as u64;
        let jitter = if self.max_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.max_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(millis + jitter)
    }
}

/// One classified call failure, before the retry budget decides whether it
/// is terminal.
#[derive(Debug)]
struct CallFailure {
    kind: ModelErrorKind,
    message: String,
    retryable: bool,
}

/// Classify an HTTP status. `None` means success.
fn classify_http_status(status: u16) -> Option<(ModelErrorKind, bool)> {
    match status {
        200..=299 => None,
        429 => Some((ModelErrorKind::RateLimited, true)),
        401 | 403 => Some((ModelErrorKind::Auth, false)),
        400..=499 => Some((ModelErrorKind::InvalidOutput, false)),
        _ => Some((ModelErrorKind::Unavailable, true)),
    }
}

/// Analyzer over plain HTTP inference endpoints.
pub struct HttpAnalyzer {
    config: AnalyzerConfig,
    http: Client,
}

impl HttpAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { config, http })
    }

    async fn attempt(
        &self,
        article_id: i64,
        content: &str,
        model: &ModelConfig,
    ) -> std::result::Result<ScoreResponse, CallFailure> {
        let request = AnalyzeRequest {
            model: &model.name,
            perspective: &model.perspective,
            article_id,
            content,
        };

        let response = self
            .http
            .post(&model.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| CallFailure {
                kind: ModelErrorKind::Unavailable,
                message: if e.is_timeout() {
                    format!("request timed out after {}s", self.config.timeout_secs)
                } else {
                    format!("request failed: {}", e)
                },
                retryable: true,
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| CallFailure {
            kind: ModelErrorKind::Unavailable,
            message: format!("failed to read response: {}", e),
            retryable: true,
        })?;

        if let Some((kind, retryable)) = classify_http_status(status) {
            return Err(CallFailure {
                kind,
                message: format!("HTTP {}: {}", status, truncate(&body, 200)),
                retryable,
            });
        }

        // Malformed bodies are retried: inference gateways occasionally emit
        // truncated JSON under load.
        let raw: serde_json::Value = serde_json::from_str(&body).map_err(|e| CallFailure {
            kind: ModelErrorKind::InvalidOutput,
            message: format!("malformed body: {}", e),
            retryable: true,
        })?;

        let reply: AnalyzeReply =
            serde_json::from_value(raw.clone()).map_err(|e| CallFailure {
                kind: ModelErrorKind::InvalidOutput,
                message: format!("unexpected reply shape: {}", e),
                retryable: true,
            })?;

        reply.normalize(&model.name, raw).map_err(|e| CallFailure {
            kind: ModelErrorKind::InvalidOutput,
            message: e.to_string(),
            retryable: false,
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl PerspectiveAnalyzer for HttpAnalyzer {
    async fn analyze(
        &self,
        article_id: i64,
        content: &str,
        model: &ModelConfig,
    ) -> Result<ScoreResponse> {
        let mut attempt = 0;
        loop {
            match self.attempt(article_id, content, model).await {
                Ok(response) => {
                    tracing::debug!(
                        article_id,
                        model = %model.name,
                        score = response.score,
                        confidence = response.confidence,
                        "perspective scored"
                    );
                    return Ok(response);
                }
                Err(failure) => {
                    if failure.retryable && attempt < self.config.max_retries {
                        let delay = self.config.delay_for_attempt(attempt);
                        tracing::warn!(
                            article_id,
                            model = %model.name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure.message,
                            "retrying model call"
                        );
                        sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(Error::model(&model.name, failure.kind, failure.message));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_http_status(200), None);
        assert_eq!(classify_http_status(204), None);
        assert_eq!(
            classify_http_status(429),
            Some((ModelErrorKind::RateLimited, true))
        );
        assert_eq!(
            classify_http_status(401),
            Some((ModelErrorKind::Auth, false))
        );
        assert_eq!(
            classify_http_status(403),
            Some((ModelErrorKind::Auth, false))
        );
        assert_eq!(
            classify_http_status(422),
            Some((ModelErrorKind::InvalidOutput, false))
        );
        assert_eq!(
            classify_http_status(500),
            Some((ModelErrorKind::Unavailable, true))
        );
        assert_eq!(
            classify_http_status(503),
            Some((ModelErrorKind::Unavailable, true))
        );
    }

    #[test]
    fn test_config_builder() {
        let config = AnalyzerConfig::new()
            .with_timeout(5)
            .with_max_retries(1)
            .with_base_delay_ms(10);

        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.base_delay_ms, 10);
    }

    #[test]
    fn test_delay_growth() {
        let config = AnalyzerConfig {
            base_delay_ms: 100,
            backoff_factor: 2.0,
            max_jitter_ms: 0,
            ..AnalyzerConfig::default()
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 200), "hello");
        assert_eq!(truncate("hello", 2), "he");
        // Multi-byte characters are not split
        assert_eq!(truncate("ééé", 2), "éé");
    }
}
