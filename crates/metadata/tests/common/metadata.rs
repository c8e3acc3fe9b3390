//! Metadata store test utilities.

use recall_metadata::{MetadataResult, MetadataStore, PostgresStore, SqliteStore};
use sqlx::{Pool, Postgres as SqlxPostgres, Sqlite};
use std::sync::Arc;
use tempfile::TempDir;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use time::OffsetDateTime;

/// Stable prefix for Docker/container startup failures in Postgres test setup.
/// Tests use this marker to decide whether to skip due to unavailable Docker.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// A test metadata store wrapper that cleans up on drop.
#[allow(dead_code)]
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    pub(crate) sqlite_store: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestMetadata {
    /// Create a new test metadata store backed by a SQLite file in a temp directory.
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let store = SqliteStore::new(&db_path, None).await?;
        let arc_store = Arc::new(store);

        Ok(Self {
            store: arc_store.clone(),
            sqlite_store: arc_store,
            _temp_dir: temp_dir,
        })
    }

    /// Get a reference to the metadata store.
    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// Get the concrete SQLite store.
    pub fn sqlite(&self) -> Arc<SqliteStore> {
        self.sqlite_store.clone()
    }

    /// Get a reference to the SQLite connection pool for raw queries.
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite_store.pool()
    }

    /// Soft-delete a session the way an external collaborator would.
    pub async fn soft_delete(&self, session_id: &str) {
        soft_delete_sqlite(self.pool(), session_id).await;
    }
}

/// Soft-delete a session row in a SQLite database.
#[allow(dead_code)]
pub async fn soft_delete_sqlite(pool: &Pool<Sqlite>, session_id: &str) {
    sqlx::query("UPDATE sessions SET deleted_at = ? WHERE session_id = ?")
        .bind(OffsetDateTime::now_utc())
        .bind(session_id)
        .execute(pool)
        .await
        .expect("soft delete failed");
}

/// Remove a session row from a SQLite database entirely.
#[allow(dead_code)]
pub async fn hard_delete_sqlite(pool: &Pool<Sqlite>, session_id: &str) {
    sqlx::query("DELETE FROM sessions WHERE session_id = ?")
        .bind(session_id)
        .execute(pool)
        .await
        .expect("hard delete failed");
}

/// PostgreSQL test metadata store wrapper that manages a testcontainer.
#[allow(dead_code)]
pub struct PostgresTestMetadata {
    pub store: Arc<dyn MetadataStore>,
    pub(crate) postgres_store: Arc<PostgresStore>,
    url: String,
    _container: ContainerAsync<Postgres>,
}

#[allow(dead_code)]
impl PostgresTestMetadata {
    /// Create a new PostgreSQL test store with a testcontainer.
    pub async fn new() -> MetadataResult<Self> {
        // Start PostgreSQL container
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                recall_metadata::MetadataError::Internal(format!(
                    "{} Failed to start PostgreSQL container: {e}",
                    POSTGRES_CONTAINER_START_ERR_PREFIX
                ))
            })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        // Default credentials from testcontainers-modules postgres
        let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

        let store = PostgresStore::new(&url, 5, None).await?;
        let arc_store = Arc::new(store);

        Ok(Self {
            store: arc_store.clone(),
            postgres_store: arc_store,
            url,
            _container: container,
        })
    }

    /// Get a reference to the metadata store.
    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// Open a second, independent store on the same database.
    ///
    /// Its pool shares nothing with the first store, like another process would.
    pub async fn second_store(&self) -> MetadataResult<Arc<dyn MetadataStore>> {
        let store = PostgresStore::new(&self.url, 5, None).await?;
        Ok(Arc::new(store))
    }

    /// Get a reference to the PostgreSQL connection pool for raw queries.
    pub fn pool(&self) -> &Pool<SqlxPostgres> {
        self.postgres_store.pool()
    }

    /// Soft-delete a session the way an external collaborator would.
    pub async fn soft_delete(&self, session_id: &str) {
        sqlx::query("UPDATE sessions SET deleted_at = $1 WHERE session_id = $2")
            .bind(OffsetDateTime::now_utc())
            .bind(session_id)
            .execute(self.pool())
            .await
            .expect("soft delete failed");
    }
}
