//! Per-article scoring progress: a thread-safe map of article id to the
//! latest [`ProgressState`], with subscription streams for server-sent
//! events and TTL-based eviction.
//!
//! Subscribers get every state the watch channel observes: the current
//! snapshot immediately, then each change. Under a fast-updating run
//! intermediate states may be skipped, but a terminal state is always
//! delivered at least once, and `last_updated` is monotone along the
//! stream.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Status of a scoring run as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProgressStatus {
    Queued,
    InProgress,
    Success,
    Error,
}

impl ProgressStatus {
    /// Whether the status ends the run's progress stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// Snapshot of a scoring run's progress.
///
/// Serialized camelCase; this is the payload the API collaborator forwards
/// verbatim as one server-sent event per snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub step: String,
    pub message: String,
    pub percent: u8,
    pub status: ProgressStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_score: Option<f64>,
    pub last_updated: DateTime<Utc>,
}

impl ProgressState {
    /// Initial state before a run holds the article lock.
    pub fn queued() -> Self {
        Self {
            step: "queued".into(),
            message: "waiting for scoring slot".into(),
            percent: 0,
            status: ProgressStatus::Queued,
            error: None,
            error_details: None,
            final_score: None,
            last_updated: Utc::now(),
        }
    }

    /// Non-terminal update during a run.
    pub fn in_progress(step: impl Into<String>, message: impl Into<String>, percent: u8) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
            percent: percent.min(100),
            status: ProgressStatus::InProgress,
            error: None,
            error_details: None,
            final_score: None,
            last_updated: Utc::now(),
        }
    }

    /// Terminal success; carries the composite score.
    pub fn success(final_score: f64) -> Self {
        Self {
            step: "done".into(),
            message: "scoring complete".into(),
            percent: 100,
            status: ProgressStatus::Success,
            error: None,
            error_details: None,
            final_score: Some(final_score),
            last_updated: Utc::now(),
        }
    }

    /// Terminal error. `percent` preserves the last value the run reached.
    pub fn error(
        code: impl Into<String>,
        details: Option<String>,
        percent: u8,
    ) -> Self {
        Self {
            step: "error".into(),
            message: "scoring failed".into(),
            percent: percent.min(100),
            status: ProgressStatus::Error,
            error: Some(code.into()),
            error_details: details,
            final_score: None,
            last_updated: Utc::now(),
        }
    }
}

/// A finite stream of progress snapshots; ends after a terminal state has
/// been delivered, or when the entry is evicted.
pub type ProgressStream = Pin<Box<dyn Stream<Item = ProgressState> + Send>>;

/// Thread-safe map of article id to latest progress, with subscriptions.
pub struct ProgressManager {
    entries: Mutex<HashMap<i64, watch::Sender<ProgressState>>>,
    ttl: ChronoDuration,
}

impl ProgressManager {
    /// Create a manager with the default 10-minute entry TTL.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: ChronoDuration::minutes(10),
        }
    }

    /// Create with a custom entry TTL.
    pub fn with_ttl(mut self, ttl: ChronoDuration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Replace the state for an article, stamping `last_updated`.
    ///
    /// Returns false without writing when the update would move a terminal
    /// state back to non-terminal (use [`reset`](Self::reset) for that), or
    /// when a non-terminal update's percent regresses — racing fan-out
    /// completions may publish out of order, and the later snapshot wins.
    pub fn set(&self, article_id: i64, mut state: ProgressState) -> bool {
        state.last_updated = Utc::now();

        let mut entries = self.entries.lock().expect("progress lock poisoned");
        match entries.get(&article_id) {
            Some(tx) => {
                let accepted = {
                    let current = tx.borrow();
                    if current.status.is_terminal() && !state.status.is_terminal() {
                        false
                    } else {
                        current.status.is_terminal()
                            || state.status.is_terminal()
                            || state.percent >= current.percent
                    }
                };
                if accepted {
                    tx.send_replace(state);
                }
                accepted
            }
            None => {
                let (tx, _rx) = watch::channel(state);
                entries.insert(article_id, tx);
                true
            }
        }
    }

    /// Publish `queued` for an article with no live run.
    ///
    /// A no-op returning false while a non-terminal state is present, so a
    /// waiter blocked on the article lock cannot clobber the running
    /// attempt's progress.
    pub fn enqueue(&self, article_id: i64) -> bool {
        let mut entries = self.entries.lock().expect("progress lock poisoned");
        match entries.get(&article_id) {
            Some(tx) => {
                let terminal = tx.borrow().status.is_terminal();
                if terminal {
                    tx.send_replace(ProgressState::queued());
                }
                terminal
            }
            None => {
                let (tx, _rx) = watch::channel(ProgressState::queued());
                entries.insert(article_id, tx);
                true
            }
        }
    }

    /// Unconditionally restart an article's progress at `queued`. Called at
    /// the start of a (re)scoring run, under the article lock.
    pub fn reset(&self, article_id: i64) {
        let mut entries = self.entries.lock().expect("progress lock poisoned");
        match entries.get(&article_id) {
            Some(tx) => {
                tx.send_replace(ProgressState::queued());
            }
            None => {
                let (tx, _rx) = watch::channel(ProgressState::queued());
                entries.insert(article_id, tx);
            }
        }
    }

    /// Latest state for an article, if tracked.
    pub fn get(&self, article_id: i64) -> Option<ProgressState> {
        let entries = self.entries.lock().expect("progress lock poisoned");
        entries.get(&article_id).map(|tx| tx.borrow().clone())
    }

    /// Subscribe to an article's progress.
    ///
    /// The stream yields the current snapshot first (creating a `queued`
    /// entry when none exists yet), then every observed change, and ends
    /// after delivering a terminal state.
    pub fn subscribe(&self, article_id: i64) -> ProgressStream {
        let rx = {
            let mut entries = self.entries.lock().expect("progress lock poisoned");
            entries
                .entry(article_id)
                .or_insert_with(|| {
                    let (tx, _rx) = watch::channel(ProgressState::queued());
                    tx
                })
                .subscribe()
        };

        struct SubState {
            rx: watch::Receiver<ProgressState>,
            first: bool,
            done: bool,
        }

        Box::pin(futures::stream::unfold(
            SubState {
                rx,
                first: true,
                done: false,
            },
            |mut sub| async move {
                if sub.done {
                    return None;
                }

                let state = if sub.first {
                    sub.first = false;
                    sub.rx.borrow_and_update().clone()
                } else {
                    if sub.rx.changed().await.is_err() {
                        // Entry evicted; end the stream.
                        return None;
                    }
                    sub.rx.borrow_and_update().clone()
                };

                if state.status.is_terminal() {
                    sub.done = true;
                }
                Some((state, sub))
            },
        ))
    }

    /// Evict entries whose `last_updated` is older than the TTL. Returns the
    /// number of evicted entries; their subscribers' streams end.
    pub fn evict_stale(&self) -> usize {
        let cutoff = Utc::now() - self.ttl;
        let mut entries = self.entries.lock().expect("progress lock poisoned");
        let before = entries.len();
        entries.retain(|_, tx| tx.borrow().last_updated >= cutoff);
        before - entries.len()
    }

    /// Number of tracked articles.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("progress lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn a background sweeper evicting stale entries every `interval`
    /// until the token is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let evicted = manager.evict_stale();
                        if evicted > 0 {
                            tracing::debug!(evicted, "evicted stale progress entries");
                        }
                    }
                }
            }
        })
    }
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_set_and_get() {
        let manager = ProgressManager::new();
        assert_eq!(manager.get(1), None);

        assert!(manager.set(1, ProgressState::in_progress("starting", "begin", 0)));
        let state = manager.get(1).unwrap();
        assert_eq!(state.step, "starting");
        assert_eq!(state.status, ProgressStatus::InProgress);
    }

    #[test]
    fn test_terminal_guard() {
        let manager = ProgressManager::new();
        manager.set(1, ProgressState::success(0.5));

        // Terminal back to non-terminal without reset is rejected
        assert!(!manager.set(1, ProgressState::in_progress("scoring:left", "m", 10)));
        assert_eq!(manager.get(1).unwrap().status, ProgressStatus::Success);

        // Reset re-opens the lifecycle
        manager.reset(1);
        assert_eq!(manager.get(1).unwrap().status, ProgressStatus::Queued);
        assert!(manager.set(1, ProgressState::in_progress("starting", "m", 0)));
    }

    #[test]
    fn test_percent_regression_dropped() {
        let manager = ProgressManager::new();
        manager.set(1, ProgressState::in_progress("scoring:right", "2/3", 66));

        assert!(!manager.set(1, ProgressState::in_progress("scoring:left", "1/3", 33)));
        assert_eq!(manager.get(1).unwrap().percent, 66);

        // Terminal states are always accepted
        assert!(manager.set(1, ProgressState::error("cancelled", None, 66)));
    }

    #[test]
    fn test_enqueue_respects_live_run() {
        let manager = ProgressManager::new();

        assert!(manager.enqueue(1));
        assert_eq!(manager.get(1).unwrap().status, ProgressStatus::Queued);

        manager.set(1, ProgressState::in_progress("starting", "m", 0));
        // A waiter cannot clobber a live run
        assert!(!manager.enqueue(1));
        assert_eq!(manager.get(1).unwrap().status, ProgressStatus::InProgress);

        manager.set(1, ProgressState::success(0.1));
        // After the run ends, enqueue re-opens
        assert!(manager.enqueue(1));
        assert_eq!(manager.get(1).unwrap().status, ProgressStatus::Queued);
    }

    #[tokio::test]
    async fn test_subscribe_delivers_terminal() {
        let manager = Arc::new(ProgressManager::new());
        manager.set(1, ProgressState::in_progress("starting", "m", 0));

        let stream = manager.subscribe(1);

        let writer = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager.set(1, ProgressState::in_progress("scoring:left", "1/2", 50));
                manager.set(1, ProgressState::success(0.25));
            })
        };

        let states: Vec<ProgressState> = stream.collect().await;
        writer.await.unwrap();

        // At least the initial snapshot and the terminal state
        assert!(!states.is_empty());
        let last = states.last().unwrap();
        assert_eq!(last.status, ProgressStatus::Success);
        assert_eq!(last.final_score, Some(0.25));

        // last_updated is monotone along the stream
        for pair in states.windows(2) {
            assert!(pair[0].last_updated <= pair[1].last_updated);
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_terminal() {
        let manager = ProgressManager::new();
        manager.set(1, ProgressState::success(0.7));

        let states: Vec<ProgressState> = manager.subscribe(1).collect().await;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].status, ProgressStatus::Success);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_article_starts_queued() {
        let manager = Arc::new(ProgressManager::new());
        let mut stream = manager.subscribe(42);

        let first = stream.next().await.unwrap();
        assert_eq!(first.status, ProgressStatus::Queued);
    }

    #[test]
    fn test_evict_stale() {
        let manager = ProgressManager::new().with_ttl(ChronoDuration::zero());
        manager.set(1, ProgressState::success(0.1));
        manager.set(2, ProgressState::in_progress("starting", "m", 0));

        // Zero TTL: everything written before "now" is stale
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(manager.evict_stale(), 2);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_wire_format() {
        let state = ProgressState::in_progress("scoring:left", "1 of 3 models", 33);
        let json = serde_json::to_value(&state).unwrap();

        assert_eq!(json["status"], "inProgress");
        assert_eq!(json["percent"], 33);
        assert!(json.get("finalScore").is_none());
        assert!(json.get("error").is_none());
        assert!(json.get("lastUpdated").is_some());

        let done = ProgressState::success(0.42);
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["finalScore"], 0.42);

        let failed = ProgressState::error("all_perspectives_invalid", Some("details".into()), 90);
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "all_perspectives_invalid");
        assert_eq!(json["errorDetails"], "details");
        assert!(json.get("finalScore").is_none());
    }
}
