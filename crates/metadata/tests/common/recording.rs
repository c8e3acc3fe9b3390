//! A store double that records calls and injects failures.

use super::metadata::{hard_delete_sqlite, soft_delete_sqlite};
use async_trait::async_trait;
use recall_metadata::repos::{SessionLockRepo, SessionRepo};
use recall_metadata::{MetadataError, MetadataResult, MetadataStore, SessionLock, SessionRow, SqliteStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use time::OffsetDateTime;

/// Wraps a [`SqliteStore`], counting every repository call.
#[allow(dead_code)]
pub struct RecordingStore {
    inner: Arc<SqliteStore>,
    pub upserts: AtomicUsize,
    pub reads: AtomicUsize,
    pub acquires: AtomicUsize,
    pub releases: AtomicUsize,
    pub locked_reads: AtomicUsize,
    pub updates: AtomicUsize,
    /// Make `update_locked_metadata` fail with a database error.
    pub fail_updates: AtomicBool,
    /// Make `release_session_lock` report an error after releasing.
    pub fail_releases: AtomicBool,
    /// Soft-delete the session right before the locked update runs.
    pub delete_before_update: AtomicBool,
    /// Remove the row right before any read (plain or locked) runs.
    pub hard_delete_before_read: AtomicBool,
    /// Remove the row right before the locked update runs.
    pub hard_delete_before_update: AtomicBool,
    /// Make `upsert_session` fail the way a timed-out query does.
    pub time_out_upserts: AtomicBool,
}

#[allow(dead_code)]
impl RecordingStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            upserts: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            acquires: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            locked_reads: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            fail_updates: AtomicBool::new(false),
            fail_releases: AtomicBool::new(false),
            delete_before_update: AtomicBool::new(false),
            hard_delete_before_read: AtomicBool::new(false),
            hard_delete_before_update: AtomicBool::new(false),
            time_out_upserts: AtomicBool::new(false),
        }
    }

    /// Total number of store calls of any kind.
    pub fn total_calls(&self) -> usize {
        [
            &self.upserts,
            &self.reads,
            &self.acquires,
            &self.releases,
            &self.locked_reads,
            &self.updates,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataStore for RecordingStore {
    async fn migrate(&self) -> MetadataResult<()> {
        self.inner.migrate().await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        self.inner.health_check().await
    }
}

#[async_trait]
impl SessionRepo for RecordingStore {
    async fn upsert_session(&self, session_id: &str) -> MetadataResult<SessionRow> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if self.time_out_upserts.load(Ordering::SeqCst) {
            return Err(MetadataError::Database(sqlx::Error::Io(
                std::io::ErrorKind::TimedOut.into(),
            )));
        }
        self.inner.upsert_session(session_id).await
    }

    async fn get_session(&self, session_id: &str) -> MetadataResult<Option<SessionRow>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.hard_delete_before_read.load(Ordering::SeqCst) {
            hard_delete_sqlite(self.inner.pool(), session_id).await;
        }
        self.inner.get_session(session_id).await
    }
}

#[async_trait]
impl SessionLockRepo for RecordingStore {
    async fn acquire_session_lock(&self, session_id: &str) -> MetadataResult<SessionLock> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        self.inner.acquire_session_lock(session_id).await
    }

    async fn release_session_lock(&self, lock: SessionLock) -> MetadataResult<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release_session_lock(lock).await?;
        if self.fail_releases.load(Ordering::SeqCst) {
            return Err(MetadataError::Internal("injected release failure".to_string()));
        }
        Ok(())
    }

    async fn get_locked_session(
        &self,
        lock: &mut SessionLock,
    ) -> MetadataResult<Option<SessionRow>> {
        self.locked_reads.fetch_add(1, Ordering::SeqCst);
        if self.hard_delete_before_read.load(Ordering::SeqCst) {
            hard_delete_sqlite(self.inner.pool(), lock.session_id()).await;
        }
        self.inner.get_locked_session(lock).await
    }

    async fn update_locked_metadata(
        &self,
        lock: &mut SessionLock,
        metadata_json: &str,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<Option<SessionRow>> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(MetadataError::Database(sqlx::Error::PoolTimedOut));
        }
        if self.delete_before_update.load(Ordering::SeqCst) {
            soft_delete_sqlite(self.inner.pool(), lock.session_id()).await;
        }
        if self.hard_delete_before_update.load(Ordering::SeqCst) {
            hard_delete_sqlite(self.inner.pool(), lock.session_id()).await;
        }
        self.inner
            .update_locked_metadata(lock, metadata_json, updated_at)
            .await
    }
}
