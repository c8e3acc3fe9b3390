//! Session repository trait.

use crate::error::MetadataResult;
use crate::models::SessionRow;
use async_trait::async_trait;

/// Repository for unlocked session operations.
#[async_trait]
pub trait SessionRepo: Send + Sync {
    /// Insert a bare session if absent, returning the current row either way.
    ///
    /// On conflict the existing row is returned untouched: metadata is never
    /// modified and a soft-deleted session stays deleted.
    async fn upsert_session(&self, session_id: &str) -> MetadataResult<SessionRow>;

    /// Get a session by identifier, including soft-deleted sessions.
    /// Returns None if no row exists.
    async fn get_session(&self, session_id: &str) -> MetadataResult<Option<SessionRow>>;
}
