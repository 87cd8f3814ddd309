//! # newsbalancer-core
//!
//! The NewsBalancer scoring engine: analyzes news articles for political
//! bias by consulting several model "perspectives" concurrently, aggregates
//! the per-perspective scores into a composite with confidence, persists the
//! outcome atomically, and publishes real-time progress for server-sent
//! streams.
//!
//! ## Core Components
//!
//! - **Store**: durable articles, per-model scores, and composite results
//! - **Cache**: advisory in-memory map keyed by (article, model)
//! - **Model**: stateless client over the inference endpoints
//! - **Progress**: per-article progress states with subscriptions
//! - **Aggregate**: pure composite computation with explicit failure modes
//! - **Engine**: the per-article orchestrator
//! - **Scheduler**: worker-pool batch runner over pending articles
//!
//! ## Example
//!
//! ```rust,ignore
//! use newsbalancer_core::{
//!     AnalyzerConfig, HttpAnalyzer, ModelConfig, ProgressManager, ScoringConfig,
//!     ScoringEngine, SqliteScoreStore,
//! };
//! use std::sync::Arc;
//!
//! let store = Arc::new(SqliteScoreStore::open("news.db")?);
//! let analyzer = Arc::new(HttpAnalyzer::new(AnalyzerConfig::new())?);
//! let progress = Arc::new(ProgressManager::new());
//!
//! let config = ScoringConfig::new(vec![
//!     ModelConfig::new("left", "http://inference/left", "progressive"),
//!     ModelConfig::new("center", "http://inference/center", "neutral"),
//!     ModelConfig::new("right", "http://inference/right", "conservative"),
//! ]);
//!
//! let engine = Arc::new(ScoringEngine::new(store, analyzer, progress, config)?);
//! let result = engine.score_article(42).await?;
//! println!("composite: {} ({})", result.score, result.confidence);
//! ```

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod progress;
pub mod scheduler;
pub mod store;

// Re-exports for convenience
pub use aggregate::{aggregate, Composite};
pub use cache::{CacheStats, ScoreCache};
pub use config::{Formula, InvalidScorePolicy, ModelConfig, ScoringConfig};
pub use engine::{
    CompositeResult, ScoringEngine, ScoringHandle, SCORE_SOURCE_EXTERNAL, SCORE_SOURCE_LLM,
};
pub use error::{Error, ModelErrorKind, Result};
pub use model::{
    AnalyzeReply, AnalyzeRequest, AnalyzerConfig, HttpAnalyzer, PerspectiveAnalyzer, ScoreRange,
    ScoreResponse,
};
pub use progress::{ProgressManager, ProgressState, ProgressStatus, ProgressStream};
pub use scheduler::{BatchReport, BatchRunner, SchedulerConfig};
pub use store::{
    with_retry, Article, ArticleFilter, ArticleResult, ArticleStatus, Feedback, NewArticle,
    NewPerspectiveScore, PerspectiveScore, RetryPolicy, ScoreMetadata, SqliteScoreStore,
};
