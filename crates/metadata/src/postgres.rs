//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::lock::{HeldLock, SessionLock, lock_key};
use crate::models::SessionRow;
use crate::repos::{SessionLockRepo, SessionRepo};
use crate::store::MetadataStore;
use async_trait::async_trait;
use recall_core::config::PgSslMode;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

fn lock_error(session_id: &str, err: sqlx::Error) -> MetadataError {
    MetadataError::Lock {
        session_id: session_id.to_string(),
        reason: err.to_string(),
    }
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// This allows credentials to be passed separately, enabling better
    /// secret management (e.g., passwords via environment variables).
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        // Log connection info without password
        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Shorthand for `from_url`.
    pub async fn new(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        Self::from_url(url, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        // statement_timeout also bounds how long pg_advisory_lock may wait.
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement,
        // so we split the schema and execute each statement separately.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionRepo for PostgresStore {
    async fn upsert_session(&self, session_id: &str) -> MetadataResult<SessionRow> {
        // DO UPDATE (rather than DO NOTHING) so RETURNING yields the existing row.
        let now = OffsetDateTime::now_utc();
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            INSERT INTO sessions (uuid, session_id, metadata, created_at, updated_at)
            VALUES ($1, $2, '{}'::jsonb, $3, $3)
            ON CONFLICT (session_id) DO UPDATE SET session_id = EXCLUDED.session_id
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_session(&self, session_id: &str) -> MetadataResult<Option<SessionRow>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

#[async_trait]
impl SessionLockRepo for PostgresStore {
    async fn acquire_session_lock(&self, session_id: &str) -> MetadataResult<SessionLock> {
        let key = lock_key(session_id);
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| lock_error(session_id, e))?;

        // Wrap the connection before issuing the lock query: if this future is
        // dropped while waiting, the handle's drop closes the connection.
        let mut lock = SessionLock::new(session_id, key, HeldLock::Postgres(conn));
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(&mut **lock.postgres_conn()?)
            .await
            .map_err(|e| lock_error(session_id, e))?;
        lock.mark_acquired();

        tracing::debug!(session_id = session_id, lock_key = key, "session lock acquired");
        Ok(lock)
    }

    async fn release_session_lock(&self, mut lock: SessionLock) -> MetadataResult<()> {
        let key = lock.key();
        let session_id = lock.session_id().to_string();
        let conn = lock.postgres_conn()?;
        let unlocked: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut **conn)
            .await
            .map_err(|e| lock_error(&session_id, e))?;

        if !unlocked {
            tracing::warn!(
                session_id = %session_id,
                lock_key = key,
                "advisory lock was not held at release"
            );
        }

        // Unlocked cleanly: the connection may go back to the pool.
        drop(lock.take());
        tracing::debug!(session_id = %session_id, lock_key = key, "session lock released");
        Ok(())
    }

    async fn get_locked_session(
        &self,
        lock: &mut SessionLock,
    ) -> MetadataResult<Option<SessionRow>> {
        let session_id = lock.session_id().to_string();
        let conn = lock.postgres_conn()?;
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE session_id = $1")
            .bind(&session_id)
            .fetch_optional(&mut **conn)
            .await?;
        Ok(row)
    }

    async fn update_locked_metadata(
        &self,
        lock: &mut SessionLock,
        metadata_json: &str,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<Option<SessionRow>> {
        let session_id = lock.session_id().to_string();
        let conn = lock.postgres_conn()?;
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            UPDATE sessions SET metadata = $2::jsonb, updated_at = $3
            WHERE session_id = $1 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(&session_id)
        .bind(metadata_json)
        .bind(updated_at)
        .fetch_optional(&mut **conn)
        .await?;
        Ok(row)
    }
}
