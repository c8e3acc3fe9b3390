//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::lock::{HeldLock, LocalLockTable, SessionLock, lock_key};
use crate::models::SessionRow;
use crate::repos::{SessionLockRepo, SessionRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: SessionRepo + SessionLockRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
///
/// Session locks live in this process only, so a database file must not be
/// shared by several processes writing session metadata.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    locks: LocalLockTable,
    query_timeout: Duration,
}

impl SqliteStore {
    /// Create a new SQLite store.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(600); // 10 minutes default

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection avoids
            // persistent "database is locked" failures under concurrent writers.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            locks: LocalLockTable::default(),
            query_timeout: Duration::from_secs(query_timeout_secs),
        };
        store.migrate().await?;

        tracing::warn!(
            query_timeout_secs = query_timeout_secs,
            "SQLite session locks are process-local. \
             Use PostgreSQL when more than one process writes session metadata."
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Bound a query by the configured query timeout.
    async fn timed<T>(
        &self,
        query: impl Future<Output = Result<T, sqlx::Error>>,
    ) -> MetadataResult<T> {
        match tokio::time::timeout(self.query_timeout, query).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.query_timeout.as_secs(),
                    "SQLite query timed out"
                );
                Err(MetadataError::Database(sqlx::Error::Io(
                    std::io::ErrorKind::TimedOut.into(),
                )))
            }
        }
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionRepo for SqliteStore {
    async fn upsert_session(&self, session_id: &str) -> MetadataResult<SessionRow> {
        let now = OffsetDateTime::now_utc();
        let query = sqlx::query_as::<_, SessionRow>(
            r#"
            INSERT INTO sessions (uuid, session_id, metadata, created_at, updated_at)
            VALUES (?, ?, '{}', ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET session_id = excluded.session_id
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(now)
        .bind(now);
        self.timed(query.fetch_one(&self.pool)).await
    }

    async fn get_session(&self, session_id: &str) -> MetadataResult<Option<SessionRow>> {
        let query =
            sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE session_id = ?")
                .bind(session_id);
        self.timed(query.fetch_optional(&self.pool)).await
    }
}

#[async_trait]
impl SessionLockRepo for SqliteStore {
    async fn acquire_session_lock(&self, session_id: &str) -> MetadataResult<SessionLock> {
        let key = lock_key(session_id);
        let guard = self.locks.lock(key).await;
        let mut lock = SessionLock::new(session_id, key, HeldLock::Local(guard));
        lock.mark_acquired();
        tracing::debug!(session_id = session_id, lock_key = key, "session lock acquired");
        Ok(lock)
    }

    async fn release_session_lock(&self, mut lock: SessionLock) -> MetadataResult<()> {
        lock.ensure_held()?;
        drop(lock.take());
        tracing::debug!(
            session_id = lock.session_id(),
            lock_key = lock.key(),
            "session lock released"
        );
        Ok(())
    }

    async fn get_locked_session(
        &self,
        lock: &mut SessionLock,
    ) -> MetadataResult<Option<SessionRow>> {
        lock.ensure_held()?;
        self.get_session(lock.session_id()).await
    }

    async fn update_locked_metadata(
        &self,
        lock: &mut SessionLock,
        metadata_json: &str,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<Option<SessionRow>> {
        lock.ensure_held()?;
        let query = sqlx::query_as::<_, SessionRow>(
            r#"
            UPDATE sessions SET metadata = ?, updated_at = ?
            WHERE session_id = ? AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(metadata_json)
        .bind(updated_at)
        .bind(lock.session_id());
        self.timed(query.fetch_optional(&self.pool)).await
    }
}

impl From<std::io::Error> for MetadataError {
    fn from(e: std::io::Error) -> Self {
        MetadataError::Config(e.to_string())
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    uuid BLOB PRIMARY KEY,
    session_id TEXT NOT NULL UNIQUE,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_deleted_at ON sessions(deleted_at);
"#;
