//! Batch runner: drives the engine across pending articles with a fixed
//! worker pool.
//!
//! The producer feeds article ids through a bounded channel, so back-pressure
//! is implicit: it stalls whenever every worker is mid-run. A batch completes
//! when every dispatched article has reached a terminal state. There are no
//! ordering guarantees across articles beyond pending-first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::ScoringEngine;
use crate::error::{Error, Result};
use crate::store::{ArticleFilter, ArticleStatus, SqliteScoreStore};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pending articles pulled per batch
    pub batch_size: usize,
    /// Fixed worker pool size
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            workers: 4,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// Aggregate metrics for one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    /// Articles dispatched and driven to a terminal state
    pub processed: usize,
    /// Articles that reached `scored`
    pub scored: usize,
    /// Articles that reached a failed terminal state
    pub failed: usize,
    /// Model calls attempted across successful runs
    pub model_calls: usize,
    /// Per-model failures swallowed across successful runs
    pub model_failures: usize,
    /// Wall-clock duration of the batch
    pub duration: Duration,
}

impl BatchReport {
    /// Whether the batch found nothing to do.
    pub fn is_empty(&self) -> bool {
        self.processed == 0
    }
}

/// Drives the engine across pending articles.
pub struct BatchRunner {
    engine: Arc<ScoringEngine>,
    store: Arc<SqliteScoreStore>,
    config: SchedulerConfig,
}

impl BatchRunner {
    pub fn new(
        engine: Arc<ScoringEngine>,
        store: Arc<SqliteScoreStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            engine,
            store,
            config,
        }
    }

    /// Pull one bounded batch of pending articles and score them on the
    /// worker pool. Returns when every dispatched article is terminal.
    pub async fn run_pending_batch(&self, cancel: &CancellationToken) -> Result<BatchReport> {
        let started = Instant::now();

        let pending = self.store.fetch_articles(
            &ArticleFilter::new()
                .with_status(ArticleStatus::Pending)
                .with_limit(self.config.batch_size),
        )?;

        if pending.is_empty() {
            return Ok(BatchReport::default());
        }

        tracing::info!(
            batch_size = pending.len(),
            workers = self.config.workers,
            "starting scoring batch"
        );

        let (tx, rx) = mpsc::channel::<i64>(self.config.workers);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers: Vec<_> = (0..self.config.workers)
            .map(|worker| {
                let engine = Arc::clone(&self.engine);
                let rx = Arc::clone(&rx);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut report = BatchReport::default();
                    loop {
                        let article_id = {
                            let mut rx = rx.lock().await;
                            rx.recv().await
                        };
                        let Some(article_id) = article_id else { break };

                        match engine
                            .score_article_with_cancel(article_id, cancel.clone())
                            .await
                        {
                            Ok(result) => {
                                report.scored += 1;
                                report.model_calls += result.model_calls;
                                report.model_failures += result.model_failures;
                            }
                            Err(error) => {
                                report.failed += 1;
                                tracing::warn!(
                                    worker,
                                    article_id,
                                    error = %error,
                                    "batch scoring run failed"
                                );
                            }
                        }
                    }
                    report
                })
            })
            .collect();

        for article in &pending {
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = tx.send(article.id) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        drop(tx);

        let mut report = BatchReport::default();
        for worker in workers {
            let partial = worker
                .await
                .map_err(|e| Error::Internal(format!("batch worker panicked: {}", e)))?;
            report.scored += partial.scored;
            report.failed += partial.failed;
            report.model_calls += partial.model_calls;
            report.model_failures += partial.model_failures;
        }
        report.processed = report.scored + report.failed;
        report.duration = started.elapsed();

        tracing::info!(
            processed = report.processed,
            scored = report.scored,
            failed = report.failed,
            model_calls = report.model_calls,
            model_failures = report.model_failures,
            duration_ms = report.duration.as_millis() as u64,
            "scoring batch complete"
        );
        if let Ok(counts) = self.store.count_articles_by_status() {
            tracing::debug!(?counts, "article status counts after batch");
        }

        Ok(report)
    }

    /// Run batches until no pending articles remain or the token is
    /// cancelled.
    pub async fn drain_pending(&self, cancel: &CancellationToken) -> Result<Vec<BatchReport>> {
        let mut reports = Vec::new();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let report = self.run_pending_batch(cancel).await?;
            if report.is_empty() {
                break;
            }
            reports.push(report);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, ScoringConfig};
    use crate::error::ModelErrorKind;
    use crate::model::{PerspectiveAnalyzer, ScoreResponse};
    use crate::progress::ProgressManager;
    use crate::store::NewArticle;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    struct FixedAnalyzer {
        score: f64,
        confidence: f64,
    }

    #[async_trait]
    impl PerspectiveAnalyzer for FixedAnalyzer {
        async fn analyze(
            &self,
            _article_id: i64,
            _content: &str,
            _model: &ModelConfig,
        ) -> crate::error::Result<ScoreResponse> {
            Ok(ScoreResponse {
                score: self.score,
                confidence: self.confidence,
                reasoning: None,
                raw: serde_json::Value::Null,
            })
        }
    }

    struct DownAnalyzer;

    #[async_trait]
    impl PerspectiveAnalyzer for DownAnalyzer {
        async fn analyze(
            &self,
            _article_id: i64,
            _content: &str,
            model: &ModelConfig,
        ) -> crate::error::Result<ScoreResponse> {
            Err(crate::error::Error::model(
                &model.name,
                ModelErrorKind::Unavailable,
                "endpoint down",
            ))
        }
    }

    fn two_model_config() -> ScoringConfig {
        ScoringConfig::new(vec![
            ModelConfig::new("left", "http://inference/left", "progressive"),
            ModelConfig::new("right", "http://inference/right", "conservative"),
        ])
    }

    fn seed_articles(store: &SqliteScoreStore, count: usize) {
        for i in 0..count {
            store
                .insert_article(&NewArticle {
                    source: "example-times".into(),
                    url: format!("http://example.com/batch/{}", i),
                    title: format!("Article {}", i),
                    content: "Body text.".into(),
                    pub_date: Utc.with_ymd_and_hms(2026, 1, 15, 8, 30, 0).unwrap(),
                })
                .unwrap();
        }
    }

    fn runner(
        analyzer: Arc<dyn PerspectiveAnalyzer>,
        config: SchedulerConfig,
        articles: usize,
    ) -> (BatchRunner, Arc<SqliteScoreStore>) {
        let store = Arc::new(SqliteScoreStore::in_memory().unwrap());
        seed_articles(&store, articles);

        let engine = Arc::new(
            ScoringEngine::new(
                Arc::clone(&store),
                analyzer,
                Arc::new(ProgressManager::new()),
                two_model_config(),
            )
            .unwrap(),
        );

        (
            BatchRunner::new(engine, Arc::clone(&store), config),
            store,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batch_scores_all_pending() {
        let (runner, store) = runner(
            Arc::new(FixedAnalyzer {
                score: 0.2,
                confidence: 0.9,
            }),
            SchedulerConfig::new().with_batch_size(10).with_workers(2),
            5,
        );

        let report = runner
            .run_pending_batch(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.processed, 5);
        assert_eq!(report.scored, 5);
        assert_eq!(report.failed, 0);
        assert_eq!(report.model_calls, 10);

        let counts = store.count_articles_by_status().unwrap();
        assert_eq!(counts.get(&ArticleStatus::Scored), Some(&5));
        assert_eq!(counts.get(&ArticleStatus::Pending), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batch_counts_failures() {
        let (runner, store) = runner(
            Arc::new(DownAnalyzer),
            SchedulerConfig::new().with_batch_size(10).with_workers(2),
            3,
        );

        let report = runner
            .run_pending_batch(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.processed, 3);
        assert_eq!(report.scored, 0);
        assert_eq!(report.failed, 3);

        let counts = store.count_articles_by_status().unwrap();
        assert_eq!(counts.get(&ArticleStatus::FailedError), Some(&3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_drain_runs_multiple_batches() {
        let (runner, store) = runner(
            Arc::new(FixedAnalyzer {
                score: -0.1,
                confidence: 0.7,
            }),
            SchedulerConfig::new().with_batch_size(4).with_workers(2),
            10,
        );

        let reports = runner.drain_pending(&CancellationToken::new()).await.unwrap();

        assert_eq!(reports.len(), 3); // 4 + 4 + 2
        let total: usize = reports.iter().map(|r| r.processed).sum();
        assert_eq!(total, 10);

        let counts = store.count_articles_by_status().unwrap();
        assert_eq!(counts.get(&ArticleStatus::Scored), Some(&10));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (runner, _store) = runner(
            Arc::new(FixedAnalyzer {
                score: 0.0,
                confidence: 1.0,
            }),
            SchedulerConfig::default(),
            0,
        );

        let report = runner
            .run_pending_batch(&CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let (runner, store) = runner(
            Arc::new(FixedAnalyzer {
                score: 0.0,
                confidence: 1.0,
            }),
            SchedulerConfig::new().with_batch_size(10).with_workers(2),
            5,
        );

        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = runner.run_pending_batch(&cancel).await.unwrap();

        // Nothing dispatched reaches scored; runs dispatched before the
        // cancel observed terminal failed states at most
        assert_eq!(report.scored, 0);
        let counts = store.count_articles_by_status().unwrap();
        assert!(counts.get(&ArticleStatus::Scored).is_none());
    }
}
