//! Session lock repository trait.

use crate::error::MetadataResult;
use crate::lock::SessionLock;
use crate::models::SessionRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for per-session locking and the reads/writes made under it.
#[async_trait]
pub trait SessionLockRepo: Send + Sync {
    /// Wait for the exclusive lock on `session_id`.
    ///
    /// Dropping the returned future abandons the wait; any resource taken for
    /// the attempt is discarded rather than reused.
    async fn acquire_session_lock(&self, session_id: &str) -> MetadataResult<SessionLock>;

    /// Release a lock obtained from `acquire_session_lock`.
    async fn release_session_lock(&self, lock: SessionLock) -> MetadataResult<()>;

    /// Read the locked session. Returns None if the row no longer exists.
    async fn get_locked_session(&self, lock: &mut SessionLock)
    -> MetadataResult<Option<SessionRow>>;

    /// Replace the locked session's metadata with `metadata_json`.
    ///
    /// Only live sessions are written. Returns None when the row is gone or
    /// has been soft-deleted.
    async fn update_locked_metadata(
        &self,
        lock: &mut SessionLock,
        metadata_json: &str,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<Option<SessionRow>>;
}
