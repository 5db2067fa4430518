use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and create the schema
    ///
    /// `":memory:"` opens a private in-memory database backed by a single
    /// connection (every SQLite connection gets its own in-memory database).
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process holds the
    /// database lock (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Other` for other database errors.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        // SEC-010: Pre-create the database file user-only before the pool touches it
        #[cfg(unix)]
        if !in_memory {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            } else if let Some(parent) = db_path.parent() {
                if parent.as_os_str().is_empty() || parent.exists() {
                    use std::os::unix::fs::OpenOptionsExt;
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // If creation fails, SQLite will report the error at connect_with.
                }
            }
        }

        // busy_timeout=5000: concurrent per-address commits wait for the write lock
        // instead of failing with SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000");
        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .acquire_timeout(Duration::from_secs(10));
        if in_memory {
            // Closing the only connection would discard the database
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("sqlite_busy")
                || error_string.contains("sqlite_locked")
            {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Create tables and indexes atomically within a transaction.
    ///
    /// Every statement uses `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // One row per (query, canonical address)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tallies (
                query TEXT NOT NULL,
                address TEXT NOT NULL,
                score INTEGER NOT NULL DEFAULT 0,
                last_active INTEGER NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (query, address)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Contributing posts; rowid order is the order posts were folded in
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tally_posts (
                query TEXT NOT NULL,
                address TEXT NOT NULL,
                post_id INTEGER NOT NULL,
                author TEXT NOT NULL DEFAULT '',
                text TEXT NOT NULL DEFAULT '',
                weight INTEGER NOT NULL DEFAULT 1,
                UNIQUE (query, address, post_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Watermark lookup and the feed's "active since" range scan
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tallies_query_active ON tallies(query, last_active DESC)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tally_posts_key ON tally_posts(query, address)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
