//! The scoring engine: orchestrates one article's scoring run end to end.
//!
//! A run holds the article's lock, publishes progress, fans out model calls
//! through the analyzer (consulting the cache), persists per-model scores,
//! aggregates the authoritative set read back from the store, and writes the
//! composite atomically. Concurrent requests for the same article serialize
//! on a lazily-populated lock table; requests for different articles run in
//! parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::aggregate::aggregate;
use crate::cache::ScoreCache;
use crate::config::{ModelConfig, ScoringConfig};
use crate::error::{Error, Result};
use crate::model::PerspectiveAnalyzer;
use crate::progress::{ProgressManager, ProgressState, ProgressStatus, ProgressStream};
use crate::store::{
    with_retry, Article, ArticleResult, ArticleStatus, NewPerspectiveScore, RetryPolicy,
    ScoreMetadata, SqliteScoreStore,
};

/// `score_source` written by model-driven runs.
pub const SCORE_SOURCE_LLM: &str = "llm";
/// `score_source` written when scores are supplied by the caller.
pub const SCORE_SOURCE_EXTERNAL: &str = "external";

/// Terminal outcome of a successful scoring run.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeResult {
    pub article_id: i64,
    pub score: f64,
    pub confidence: f64,
    pub status: ArticleStatus,
    /// Model calls attempted during this run
    pub model_calls: usize,
    /// Model calls that ended in a swallowed per-model failure
    pub model_failures: usize,
}

/// Handle to a background scoring run started by
/// [`ScoringEngine::score_article_async`].
pub struct ScoringHandle {
    pub article_id: i64,
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<Result<CompositeResult>>,
}

impl ScoringHandle {
    /// Request cooperative cancellation of the run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token observed by the run; clone to tie other work to it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run's terminal outcome.
    pub async fn wait(self) -> Result<CompositeResult> {
        self.join
            .await
            .map_err(|e| Error::Internal(format!("scoring task panicked: {}", e)))?
    }
}

/// The scoring orchestrator.
pub struct ScoringEngine {
    store: Arc<SqliteScoreStore>,
    analyzer: Arc<dyn PerspectiveAnalyzer>,
    progress: Arc<ProgressManager>,
    cache: ScoreCache,
    config: ScoringConfig,
    retry: RetryPolicy,
    max_fanout: usize,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl ScoringEngine {
    /// Create an engine. The configuration is validated here so a duplicate
    /// model name or bad weight fails fast instead of mid-run.
    pub fn new(
        store: Arc<SqliteScoreStore>,
        analyzer: Arc<dyn PerspectiveAnalyzer>,
        progress: Arc<ProgressManager>,
        config: ScoringConfig,
    ) -> Result<Self> {
        config.validate()?;
        let max_fanout = config.model_count();

        Ok(Self {
            store,
            analyzer,
            progress,
            cache: ScoreCache::new(),
            config,
            retry: RetryPolicy::default(),
            max_fanout,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Override the store retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound the per-article model fan-out (default: number of configured
    /// models).
    pub fn with_max_fanout(mut self, max_fanout: usize) -> Self {
        self.max_fanout = max_fanout.max(1);
        self
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn progress(&self) -> &Arc<ProgressManager> {
        &self.progress
    }

    /// Hand out the per-article mutex, creating it on first use. The table
    /// only grows; entries are small and article ids are bounded by the
    /// corpus.
    fn lock_for(&self, article_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        Arc::clone(
            locks
                .entry(article_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Score an article and wait for the terminal outcome.
    pub async fn score_article(&self, article_id: i64) -> Result<CompositeResult> {
        self.score_article_with_cancel(article_id, CancellationToken::new())
            .await
    }

    /// Score an article, overwriting any previous terminal state. Composite
    /// fields are replaced; `url`, `created_at`, and per-model version
    /// monotonicity are preserved.
    pub async fn rescore(&self, article_id: i64) -> Result<CompositeResult> {
        self.score_article_with_cancel(article_id, CancellationToken::new())
            .await
    }

    /// Score an article under a caller-supplied cancellation token.
    ///
    /// Cancellation is cooperative: lock acquisition, model calls, store
    /// retries, and backoff sleeps all observe the token. A cancelled run
    /// ends with article status `failed_error` and a terminal `cancelled`
    /// progress state; no partial composite is written.
    pub async fn score_article_with_cancel(
        &self,
        article_id: i64,
        cancel: CancellationToken,
    ) -> Result<CompositeResult> {
        let run_id = Uuid::new_v4();
        self.progress.enqueue(article_id);

        let lock = self.lock_for(article_id);
        let _guard = tokio::select! {
            _ = cancel.cancelled() => {
                // Run states are published only by the lock holder. A
                // cancelled waiter may close out a queued entry, but must
                // not touch a live run's progress.
                let queued = self
                    .progress
                    .get(article_id)
                    .map(|s| s.status == ProgressStatus::Queued)
                    .unwrap_or(false);
                if queued {
                    self.progress
                        .set(article_id, ProgressState::error("cancelled", None, 0));
                }
                return Err(Error::Cancelled);
            }
            guard = lock.lock() => guard,
        };

        let result = async {
            self.progress.reset(article_id);
            self.progress.set(
                article_id,
                ProgressState::in_progress("starting", "preparing scoring run", 0),
            );

            match self.run_pipeline(article_id, &cancel).await {
                Ok(result) => Ok(result),
                Err(error) => {
                    self.finalize_failure(article_id, &error).await;
                    Err(error)
                }
            }
        }
        .instrument(tracing::info_span!("scoring_run", article_id, run_id = %run_id))
        .await;

        self.cache.evict_article(article_id).await;
        result
    }

    /// Start a scoring run in the background and return immediately with a
    /// handle. Progress is observable via [`subscribe_progress`].
    ///
    /// [`subscribe_progress`]: Self::subscribe_progress
    pub fn score_article_async(self: &Arc<Self>, article_id: i64) -> ScoringHandle {
        let cancel = CancellationToken::new();
        self.progress.enqueue(article_id);

        let engine = Arc::clone(self);
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            engine.score_article_with_cancel(article_id, token).await
        });

        ScoringHandle {
            article_id,
            cancel,
            join,
        }
    }

    /// Persist caller-supplied perspective scores and aggregate them,
    /// skipping the model fan-out. Used when scores arrive with the article
    /// (e.g. ingest-time imports). Writes `score_source = "external"`.
    pub async fn score_article_with_scores(
        &self,
        article_id: i64,
        scores: Vec<NewPerspectiveScore>,
    ) -> Result<CompositeResult> {
        for score in &scores {
            if score.article_id != article_id {
                return Err(Error::InvalidInput(format!(
                    "score for article {} supplied to run for article {}",
                    score.article_id, article_id
                )));
            }
        }

        let cancel = CancellationToken::new();
        self.progress.enqueue(article_id);
        let lock = self.lock_for(article_id);
        let _guard = lock.lock().await;

        self.progress.reset(article_id);
        self.progress.set(
            article_id,
            ProgressState::in_progress("starting", "persisting supplied scores", 0),
        );

        let outcome = async {
            with_retry(&self.retry, &cancel, || {
                self.store.begin_scoring_attempt(article_id)
            })
            .await?;

            let total = scores.len().max(1);
            for (i, score) in scores.iter().enumerate() {
                with_retry(&self.retry, &cancel, || {
                    self.store.upsert_perspective_score(score)
                })
                .await?;
                self.progress.set(
                    article_id,
                    ProgressState::in_progress(
                        format!("scoring:{}", score.model),
                        format!("{} of {} scores persisted", i + 1, total),
                        ((100 * (i + 1)) / total) as u8,
                    ),
                );
            }

            self.aggregate_and_persist(article_id, &cancel, SCORE_SOURCE_EXTERNAL, 0, 0)
                .await
        }
        .await;

        let outcome = match outcome {
            Ok(result) => Ok(result),
            Err(error) => {
                self.finalize_failure(article_id, &error).await;
                Err(error)
            }
        };

        self.cache.evict_article(article_id).await;
        outcome
    }

    /// Subscribe to an article's progress stream.
    pub fn subscribe_progress(&self, article_id: i64) -> ProgressStream {
        self.progress.subscribe(article_id)
    }

    /// Current composite projection of an article.
    pub fn fetch_article_result(&self, article_id: i64) -> Result<ArticleResult> {
        let article = self.store.fetch_article(article_id)?;
        Ok(ArticleResult {
            article_id: article.id,
            composite_score: article.composite_score,
            confidence: article.confidence,
            status: article.status,
            score_source: article.score_source,
        })
    }

    // ==================== Run Internals ====================

    async fn run_pipeline(
        &self,
        article_id: i64,
        cancel: &CancellationToken,
    ) -> Result<CompositeResult> {
        with_retry(&self.retry, cancel, || {
            self.store.begin_scoring_attempt(article_id)
        })
        .await?;

        let article =
            with_retry(&self.retry, cancel, || self.store.fetch_article(article_id)).await?;

        let (model_calls, model_failures) = self.fan_out(&article, cancel).await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.aggregate_and_persist(
            article_id,
            cancel,
            SCORE_SOURCE_LLM,
            model_calls,
            model_failures,
        )
        .await
    }

    /// Fan out one model call per configured model, bounded by `max_fanout`.
    /// Returns (calls attempted, per-model failures swallowed).
    async fn fan_out(
        &self,
        article: &Article,
        cancel: &CancellationToken,
    ) -> Result<(usize, usize)> {
        let total = self.config.models.len();
        let done = Arc::new(AtomicUsize::new(0));
        let semaphore = Arc::new(Semaphore::new(self.max_fanout));

        let tasks = self.config.models.iter().map(|model| {
            let done = Arc::clone(&done);
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let outcome = self.score_one_model(article, model, cancel).await;

                let completed = done.fetch_add(1, Ordering::SeqCst) + 1;
                self.progress.set(
                    article.id,
                    ProgressState::in_progress(
                        format!("scoring:{}", model.name),
                        format!("{} of {} perspectives scored", completed, total),
                        ((100 * completed) / total) as u8,
                    ),
                );
                outcome
            }
        });

        let mut failures = 0;
        for result in join_all(tasks).await {
            match result {
                Ok(()) => {}
                Err(error @ Error::Model { .. }) => {
                    // A single missing perspective does not abort the run;
                    // the model is simply absent from aggregation.
                    tracing::warn!(
                        article_id = article.id,
                        error = %error,
                        "perspective failed; continuing with remaining models"
                    );
                    failures += 1;
                }
                Err(other) => return Err(other),
            }
        }

        Ok((total, failures))
    }

    /// Score one perspective: cache lookup, model call, persisted upsert.
    async fn score_one_model(
        &self,
        article: &Article,
        model: &ModelConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let response = match self.cache.get(article.id, &model.name).await {
            Some(cached) => {
                tracing::debug!(
                    article_id = article.id,
                    model = %model.name,
                    "score cache hit"
                );
                cached
            }
            None => {
                let response = tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    r = self.analyzer.analyze(article.id, &article.content, model) => r?,
                };
                self.cache
                    .put(article.id, &model.name, response.clone())
                    .await;
                response
            }
        };

        let mut metadata = ScoreMetadata::new(response.confidence);
        metadata.reasoning = response.reasoning.clone();
        if !response.raw.is_null() {
            metadata
                .extra
                .insert("raw".into(), response.raw.clone());
        }

        let score = NewPerspectiveScore {
            article_id: article.id,
            model: model.name.clone(),
            score: response.score,
            metadata,
        };
        with_retry(&self.retry, cancel, || {
            self.store.upsert_perspective_score(&score)
        })
        .await
    }

    /// Read the authoritative score set back from the store, aggregate, and
    /// persist the composite. The cache is never consulted here.
    async fn aggregate_and_persist(
        &self,
        article_id: i64,
        cancel: &CancellationToken,
        score_source: &str,
        model_calls: usize,
        model_failures: usize,
    ) -> Result<CompositeResult> {
        self.progress.set(
            article_id,
            ProgressState::in_progress("aggregating", "combining perspective scores", 100),
        );

        let scores = with_retry(&self.retry, cancel, || {
            self.store.fetch_perspective_scores(article_id)
        })
        .await?;

        let composite = aggregate(&scores, &self.config)?;

        self.progress.set(
            article_id,
            ProgressState::in_progress("persisting", "writing composite score", 100),
        );
        with_retry(&self.retry, cancel, || {
            self.store.update_article_composite(
                article_id,
                composite.score,
                composite.confidence,
                score_source,
                ArticleStatus::Scored,
            )
        })
        .await?;

        self.progress
            .set(article_id, ProgressState::success(composite.score));
        tracing::info!(
            article_id,
            score = composite.score,
            confidence = composite.confidence,
            model_failures,
            "article scored"
        );

        Ok(CompositeResult {
            article_id,
            score: composite.score,
            confidence: composite.confidence,
            status: ArticleStatus::Scored,
            model_calls,
            model_failures,
        })
    }

    /// Translate a run failure into the article status transition and the
    /// terminal progress state. Persistence here is best-effort and ignores
    /// the run's cancellation: a cancelled run must still land on
    /// `failed_error`.
    async fn finalize_failure(&self, article_id: i64, error: &Error) {
        let status = failure_status(error);
        let percent = self
            .progress
            .get(article_id)
            .map(|s| s.percent)
            .unwrap_or(0);

        let cancel = CancellationToken::new();
        if let Err(persist_err) = with_retry(&self.retry, &cancel, || {
            self.store.update_article_status(article_id, status)
        })
        .await
        {
            tracing::error!(
                article_id,
                error = %persist_err,
                "failed to persist failure status"
            );
        }

        if bumps_fail_count(error) {
            if let Err(persist_err) = with_retry(&self.retry, &cancel, || {
                self.store.increment_fail_count(article_id)
            })
            .await
            {
                tracing::error!(
                    article_id,
                    error = %persist_err,
                    "failed to bump fail count"
                );
            }
        }

        self.progress.set(
            article_id,
            ProgressState::error(error.wire_code(), Some(error.to_string()), percent),
        );
        tracing::warn!(
            article_id,
            status = %status,
            error = %error,
            "scoring run failed"
        );
    }
}

/// Article status for a failed run.
fn failure_status(error: &Error) -> ArticleStatus {
    match error {
        Error::AllPerspectivesInvalid => ArticleStatus::FailedAllInvalid,
        Error::AllScoresZeroConfidence => ArticleStatus::FailedZeroConfidence,
        _ => ArticleStatus::FailedError,
    }
}

/// Whether a failure counts against the article's attempt counter.
/// Cancellation does not: it aborted the attempt rather than failing it.
fn bumps_fail_count(error: &Error) -> bool {
    !matches!(error, Error::Cancelled)
}
