//! SQLite schema and migrations for the score store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // Enable WAL mode for better concurrent access
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // Enable foreign keys
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // Create schema version table
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    // Check current version
    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    // Apply migrations
    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

/// Apply version 1 schema.
///
/// The UNIQUE(article_id, model) constraint on perspective_scores carries the
/// upsert discipline; it must exist before the engine runs.
fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    // Articles table
    conn.execute(
        "CREATE TABLE IF NOT EXISTS articles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            url TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            pub_date TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            status TEXT NOT NULL DEFAULT 'pending',
            fail_count INTEGER NOT NULL DEFAULT 0,
            last_attempt TEXT,
            composite_score REAL,
            confidence REAL,
            score_source TEXT
        )",
        [],
    )?;

    // Per-model perspective scores; one row per (article, model)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS perspective_scores (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            article_id INTEGER NOT NULL,
            model TEXT NOT NULL,
            score REAL NOT NULL,
            metadata TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (article_id, model),
            FOREIGN KEY (article_id) REFERENCES articles(id) ON DELETE CASCADE
        )",
        [],
    )?;

    // Feedback table; opaque to the core, referenced by article
    conn.execute(
        "CREATE TABLE IF NOT EXISTS feedback (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            article_id INTEGER NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (article_id) REFERENCES articles(id) ON DELETE CASCADE
        )",
        [],
    )?;

    // Indexes for common queries
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_articles_status ON articles(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_articles_pub_date ON articles(pub_date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_article_version
            ON perspective_scores(article_id, version)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feedback_article ON feedback(article_id)",
        [],
    )?;

    // Record migration
    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Check if the schema is initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='articles'",
        [],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_schema() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        assert!(is_initialized(&conn));
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_idempotent_initialization() {
        let conn = Connection::open_in_memory().unwrap();

        // Initialize twice
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_unique_article_model_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO articles (source, url, title, content, pub_date)
             VALUES ('s', 'http://example.com/a', 't', 'c', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        conn.execute(
            "INSERT INTO perspective_scores (article_id, model, score, metadata)
             VALUES (1, 'left', -0.5, '{\"confidence\":0.8}')",
            [],
        )
        .unwrap();

        let dup = conn.execute(
            "INSERT INTO perspective_scores (article_id, model, score, metadata)
             VALUES (1, 'left', 0.5, '{\"confidence\":0.2}')",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_unique_url_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO articles (source, url, title, content, pub_date)
             VALUES ('s', 'http://example.com/a', 't', 'c', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let dup = conn.execute(
            "INSERT INTO articles (source, url, title, content, pub_date)
             VALUES ('s2', 'http://example.com/a', 't2', 'c2', '2026-01-02T00:00:00Z')",
            [],
        );
        assert!(dup.is_err());
    }
}
