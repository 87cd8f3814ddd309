//! SQLite-backed score store implementation.
//!
//! All durable state lives here. The connection sits behind a mutex; every
//! mutation is a single statement or a transaction, so concurrent scoring
//! runs serialize on the store rather than interleaving partial writes.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::store::schema::{initialize_schema, is_initialized};
use crate::store::types::{
    Article, ArticleFilter, ArticleStatus, Feedback, NewArticle, NewPerspectiveScore,
    PerspectiveScore, ScoreMetadata,
};

/// SQLite-backed score store.
pub struct SqliteScoreStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteScoreStore {
    /// Open or create a score store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Database(e.to_string()))?;

        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::Database(e.to_string()))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Database(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::Database(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {}", e)))?;
        f(&conn).map_err(classify_sqlite_error)
    }

    // ==================== Article Operations ====================

    /// Insert an article produced by ingestion; status starts at `pending`.
    pub fn insert_article(&self, article: &NewArticle) -> Result<i64> {
        let result = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO articles (source, url, title, content, pub_date, created_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')",
                params![
                    article.source,
                    article.url,
                    article.title,
                    article.content,
                    article.pub_date.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        });

        match result {
            Err(Error::DuplicateUrl(_)) => Err(Error::DuplicateUrl(article.url.clone())),
            other => other,
        }
    }

    /// Fetch a single article.
    pub fn fetch_article(&self, id: i64) -> Result<Article> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, source, url, title, content, pub_date, created_at, status,
                        fail_count, last_attempt, composite_score, confidence, score_source
                 FROM articles WHERE id = ?1",
                params![id],
                row_to_article,
            )
            .optional()
        })?
        .ok_or_else(|| Error::NotFound(format!("article {}", id)))
    }

    /// Fetch articles matching a filter.
    pub fn fetch_articles(&self, filter: &ArticleFilter) -> Result<Vec<Article>> {
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT id, source, url, title, content, pub_date, created_at, status,
                        fail_count, last_attempt, composite_score, confidence, score_source
                 FROM articles WHERE 1=1",
            );
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(status) = filter.status {
                sql.push_str(" AND status = ?");
                params_vec.push(Box::new(status.as_str().to_string()));
            }

            if let Some(ref source) = filter.source {
                sql.push_str(" AND source = ?");
                params_vec.push(Box::new(source.clone()));
            }

            sql.push_str(" ORDER BY id ASC");

            if let Some(limit) = filter.limit {
                sql.push_str(&format!(" LIMIT {}", limit));
            }

            if let Some(offset) = filter.offset {
                sql.push_str(&format!(" OFFSET {}", offset));
            }

            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();

            let mut stmt = conn.prepare(&sql)?;
            let articles = stmt
                .query_map(params_refs.as_slice(), row_to_article)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(articles)
        })
    }

    /// Atomically write the composite outcome of a successful scoring run.
    ///
    /// Composite and confidence are validated and written together; this is
    /// the only path that sets them.
    pub fn update_article_composite(
        &self,
        id: i64,
        composite: f64,
        confidence: f64,
        score_source: &str,
        status: ArticleStatus,
    ) -> Result<()> {
        if !composite.is_finite() || !(-1.0..=1.0).contains(&composite) {
            return Err(Error::InvalidInput(format!(
                "composite score {} outside [-1, 1]",
                composite
            )));
        }
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(Error::InvalidInput(format!(
                "confidence {} outside [0, 1]",
                confidence
            )));
        }

        let rows = self.with_conn(|conn| {
            conn.execute(
                "UPDATE articles
                 SET composite_score = ?2, confidence = ?3, score_source = ?4, status = ?5
                 WHERE id = ?1",
                params![id, composite, confidence, score_source, status.as_str()],
            )
        })?;

        if rows == 0 {
            return Err(Error::NotFound(format!("article {}", id)));
        }
        Ok(())
    }

    /// Update an article's lifecycle status. Idempotent; a missing id is a
    /// no-op.
    pub fn update_article_status(&self, id: i64, status: ArticleStatus) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE articles SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
        })?;
        Ok(())
    }

    /// Mark the start of a scoring attempt: status → processing and
    /// last_attempt → now, in one statement.
    pub fn begin_scoring_attempt(&self, id: i64) -> Result<()> {
        let rows = self.with_conn(|conn| {
            conn.execute(
                "UPDATE articles SET status = 'processing', last_attempt = ?2 WHERE id = ?1",
                params![id, Utc::now().to_rfc3339()],
            )
        })?;

        if rows == 0 {
            return Err(Error::NotFound(format!("article {}", id)));
        }
        Ok(())
    }

    /// Bump the failed-attempt counter. Missing id is a no-op.
    pub fn increment_fail_count(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE articles SET fail_count = fail_count + 1 WHERE id = ?1",
                params![id],
            )
        })?;
        Ok(())
    }

    /// Article counts grouped by status, for batch reporting.
    pub fn count_articles_by_status(&self) -> Result<HashMap<ArticleStatus, u64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM articles GROUP BY status")?;
            let mut counts = HashMap::new();
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                if let Some(parsed) = ArticleStatus::parse(&status) {
                    counts.insert(parsed, count as u64);
                }
            }
            Ok(counts)
        })
    }

    // ==================== Perspective Score Operations ====================

    /// Insert or replace the score for `(article, model)`, bumping `version`
    /// on replace. Atomic with respect to the unique constraint.
    pub fn upsert_perspective_score(&self, score: &NewPerspectiveScore) -> Result<()> {
        let metadata = serde_json::to_string(&score.metadata)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO perspective_scores
                     (article_id, model, score, metadata, version, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)
                 ON CONFLICT(article_id, model) DO UPDATE SET
                     score = excluded.score,
                     metadata = excluded.metadata,
                     version = perspective_scores.version + 1,
                     created_at = excluded.created_at",
                params![
                    score.article_id,
                    score.model,
                    score.score,
                    metadata,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch the latest perspective scores for an article, one row per model,
    /// ordered by model name.
    pub fn fetch_perspective_scores(&self, article_id: i64) -> Result<Vec<PerspectiveScore>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, article_id, model, score, metadata, version, created_at
                 FROM perspective_scores
                 WHERE article_id = ?1
                 ORDER BY model ASC",
            )?;

            let scores = stmt
                .query_map(params![article_id], row_to_perspective_score)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(scores)
        })
    }

    // ==================== Feedback Operations ====================

    /// Attach opaque feedback to an article.
    pub fn insert_feedback(&self, article_id: i64, payload: &serde_json::Value) -> Result<i64> {
        let payload = serde_json::to_string(payload)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO feedback (article_id, payload, created_at) VALUES (?1, ?2, ?3)",
                params![article_id, payload, Utc::now().to_rfc3339()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Fetch feedback attached to an article, oldest first.
    pub fn fetch_feedback(&self, article_id: i64) -> Result<Vec<Feedback>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, article_id, payload, created_at
                 FROM feedback WHERE article_id = ?1 ORDER BY id ASC",
            )?;

            let feedback = stmt
                .query_map(params![article_id], |row| {
                    let payload: String = row.get(2)?;
                    Ok(Feedback {
                        id: row.get(0)?,
                        article_id: row.get(1)?,
                        payload: serde_json::from_str(&payload)
                            .map_err(|e| conversion_error(2, e))?,
                        created_at: parse_timestamp(row.get::<_, String>(3)?.as_str(), 3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(feedback)
        })
    }
}

// ==================== Row Mapping ====================

fn row_to_article(row: &rusqlite::Row) -> rusqlite::Result<Article> {
    let status: String = row.get(7)?;
    let status = ArticleStatus::parse(&status)
        .ok_or_else(|| conversion_error(7, format!("unknown article status: {}", status)))?;

    let last_attempt: Option<String> = row.get(9)?;
    let last_attempt = match last_attempt {
        Some(s) => Some(parse_timestamp(&s, 9)?),
        None => None,
    };

    Ok(Article {
        id: row.get(0)?,
        source: row.get(1)?,
        url: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        pub_date: parse_timestamp(row.get::<_, String>(5)?.as_str(), 5)?,
        created_at: parse_timestamp(row.get::<_, String>(6)?.as_str(), 6)?,
        status,
        fail_count: row.get::<_, i64>(8)? as u32,
        last_attempt,
        composite_score: row.get(10)?,
        confidence: row.get(11)?,
        score_source: row.get(12)?,
    })
}

fn row_to_perspective_score(row: &rusqlite::Row) -> rusqlite::Result<PerspectiveScore> {
    let metadata: String = row.get(4)?;
    let metadata: ScoreMetadata =
        serde_json::from_str(&metadata).map_err(|e| conversion_error(4, e))?;

    Ok(PerspectiveScore {
        id: row.get(0)?,
        article_id: row.get(1)?,
        model: row.get(2)?,
        score: row.get(3)?,
        metadata,
        version: row.get(5)?,
        created_at: parse_timestamp(row.get::<_, String>(6)?.as_str(), 6)?,
    })
}

fn parse_timestamp(s: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e))
}

fn conversion_error(
    column: usize,
    source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, source.into())
}

/// Map a rusqlite error into the crate taxonomy: busy/locked is transient,
/// unique-URL violations are conflicts, other constraint violations are
/// invalid input, the rest is a database error.
fn classify_sqlite_error(e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(code, message) => match code.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Error::Transient(e.to_string()),
            ErrorCode::ConstraintViolation => {
                let msg = message.as_deref().unwrap_or_default();
                if msg.contains("articles.url") {
                    Error::DuplicateUrl(msg.to_string())
                } else {
                    Error::InvalidInput(e.to_string())
                }
            }
            _ => Error::Database(e.to_string()),
        },
        _ => Error::Database(e.to_string()),
    }
}
