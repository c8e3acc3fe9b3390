//! Session upsert service.
//!
//! [`SessionService::put_session`] creates a session on first sight and merges
//! caller metadata into it. The read-merge-write sequence runs under the
//! session lock so that concurrent writers, in this process or any other,
//! never lose each other's keys.

use crate::error::{MetadataError, MetadataResult};
use crate::lock::SessionLock;
use crate::models::SessionRow;
use crate::store::MetadataStore;
use recall_core::config::{AppConfig, SessionConfig};
use recall_core::{Metadata, SYSTEM_METADATA_KEY, SessionId, merge};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Orchestrates session creation and metadata merges over a [`MetadataStore`].
#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn MetadataStore>,
    lock_timeout: Option<Duration>,
}

impl SessionService {
    /// Create a service with the default lock timeout.
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            lock_timeout: SessionConfig::default().lock_timeout(),
        }
    }

    /// Override how long a metadata write waits for its session lock.
    pub fn with_lock_timeout(mut self, lock_timeout: Option<Duration>) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Build the store and service described by `config`.
    pub async fn from_config(config: &AppConfig) -> MetadataResult<Self> {
        let store = crate::from_config(&config.metadata).await?;
        Ok(Self::new(store).with_lock_timeout(config.sessions.lock_timeout()))
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Create the session if needed and merge `metadata` into it.
    ///
    /// Unprivileged callers cannot write the top-level `system` key; it is
    /// dropped from their input without error. Returns the session as stored
    /// after the call.
    ///
    /// # Errors
    ///
    /// - [`MetadataError::Validation`] for an empty identifier, before any store call.
    /// - [`MetadataError::Deleted`] if the session is soft-deleted. Nothing is written.
    /// - [`MetadataError::NotFound`] if the row disappears while the call runs.
    /// - [`MetadataError::Lock`] if the session lock cannot be obtained in time.
    /// - [`MetadataError::Storage`] for database failures, naming the failed step.
    /// - [`MetadataError::Serialization`] if the merged metadata cannot be encoded.
    pub async fn put_session(
        &self,
        session_id: &str,
        mut metadata: Metadata,
        privileged: bool,
    ) -> MetadataResult<SessionRow> {
        let session_id = SessionId::parse(session_id)?;

        // Not transactional: the session row may be created even if the merge
        // below fails. A soft-deleted session is returned as-is, never revived.
        let session = self
            .store
            .upsert_session(session_id.as_str())
            .await
            .map_err(|e| e.context("failed to put session"))?;

        if session.is_deleted() {
            return Err(MetadataError::Deleted(session_id.into_string()));
        }

        if !privileged && metadata.remove(SYSTEM_METADATA_KEY).is_some() {
            tracing::debug!(
                session_id = %session_id,
                "dropped system metadata from unprivileged caller"
            );
        }

        if metadata.is_empty() {
            return self.current_session(&session_id).await;
        }

        self.put_session_metadata(&session_id, &metadata).await
    }

    /// Get a session, including soft-deleted ones. Returns None if it does not exist.
    pub async fn get_session(&self, session_id: &str) -> MetadataResult<Option<SessionRow>> {
        let session_id = SessionId::parse(session_id)?;
        self.store
            .get_session(session_id.as_str())
            .await
            .map_err(|e| e.context("failed to get session"))
    }

    /// Re-read a session that was just ensured to exist.
    async fn current_session(&self, session_id: &SessionId) -> MetadataResult<SessionRow> {
        let session = self
            .store
            .get_session(session_id.as_str())
            .await
            .map_err(|e| e.context("failed to get session"))?;

        match session {
            Some(session) if session.is_deleted() => {
                Err(MetadataError::Deleted(session_id.to_string()))
            }
            Some(session) => Ok(session),
            None => Err(MetadataError::NotFound(format!(
                "session {session_id} vanished while being read"
            ))),
        }
    }

    /// Merge `metadata` into the stored document under the session lock.
    async fn put_session_metadata(
        &self,
        session_id: &SessionId,
        metadata: &Metadata,
    ) -> MetadataResult<SessionRow> {
        let mut lock = self.acquire_lock(session_id).await?;

        let result = self.merge_locked(&mut lock, metadata).await;

        // A failed release must not mask the write's outcome. The handle is
        // consumed either way, so the lock cannot outlive its connection.
        if let Err(err) = self.store.release_session_lock(lock).await {
            tracing::error!(
                session_id = %session_id,
                error = %err,
                "failed to release session lock"
            );
        }

        result
    }

    async fn acquire_lock(&self, session_id: &SessionId) -> MetadataResult<SessionLock> {
        let acquire = self.store.acquire_session_lock(session_id.as_str());
        match self.lock_timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire).await.map_err(|_| {
                MetadataError::Lock {
                    session_id: session_id.to_string(),
                    reason: format!("timed out after {}ms", timeout.as_millis()),
                }
            })?,
            None => acquire.await,
        }
    }

    async fn merge_locked(
        &self,
        lock: &mut SessionLock,
        incoming: &Metadata,
    ) -> MetadataResult<SessionRow> {
        let session_id = lock.session_id().to_string();

        // Another writer may have merged since the unlocked upsert; read the
        // latest version now that we hold the lock.
        let current = self
            .store
            .get_locked_session(lock)
            .await
            .map_err(|e| e.context("failed to get session"))?
            .ok_or_else(|| MetadataError::NotFound(format!("session {session_id}")))?;

        if current.is_deleted() {
            return Err(MetadataError::Deleted(session_id));
        }

        let merged = merge(&current.metadata, incoming);
        let merged_json = merged.to_json_string()?;

        let updated = self
            .store
            .update_locked_metadata(lock, &merged_json, OffsetDateTime::now_utc())
            .await
            .map_err(|e| e.context("failed to update session metadata"))?;

        match updated {
            Some(session) => Ok(session),
            // Soft deletes do not take the session lock, so one can land
            // between the locked read and the write.
            None => match self
                .store
                .get_locked_session(lock)
                .await
                .map_err(|e| e.context("failed to get session"))?
            {
                Some(_) => Err(MetadataError::Deleted(session_id)),
                None => Err(MetadataError::NotFound(format!("session {session_id}"))),
            },
        }
    }
}
