//! Model client: a stateless façade over the external inference endpoints.
//!
//! Each configured perspective model is an HTTP endpoint returning a score,
//! a confidence, and optional reasoning. The client applies bounded
//! timeouts, retries transient failures with exponential backoff, and
//! normalizes every reply into a [`ScoreResponse`] with `score ∈ [-1, 1]`
//! and `confidence ∈ [0, 1]`.

mod client;
mod types;

pub use client::{AnalyzerConfig, HttpAnalyzer, PerspectiveAnalyzer};
pub use types::{AnalyzeReply, AnalyzeRequest, ScoreRange, ScoreResponse};
