//! Per-session mutual exclusion for metadata writes.
//!
//! A session lock is keyed by a stable 64-bit hash of the session identifier.
//! On PostgreSQL the key is handed to `pg_advisory_lock`, which ties the lock
//! to one database connection: the [`SessionLock`] owns that connection until
//! it is released, and the locked read and write run on it. Closing the
//! connection ends the database session and frees the lock, so a lock that is
//! dropped without an explicit release (task cancelled, panic) closes its
//! connection rather than returning it to the pool still locked.
//!
//! SQLite has no advisory locks; [`LocalLockTable`] provides the same
//! exclusion within one process.

use crate::error::{MetadataError, MetadataResult};
use sha2::{Digest, Sha256};
use sqlx::Postgres;
use sqlx::pool::PoolConnection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

const LOCK_NAMESPACE: &[u8] = b"recall:session:";

/// Derive the advisory lock key for a session identifier.
///
/// The key is the first eight bytes of SHA-256 over a namespaced identifier,
/// read as a big-endian `i64`. It must never change between releases: two
/// processes running different versions would otherwise lock different keys.
pub fn lock_key(session_id: &str) -> i64 {
    let digest = Sha256::new()
        .chain_update(LOCK_NAMESPACE)
        .chain_update(session_id.as_bytes())
        .finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Backend-specific resource that keeps a session lock held.
pub(crate) enum HeldLock {
    /// Connection whose database session owns the advisory lock.
    Postgres(PoolConnection<Postgres>),
    /// Guard from the in-process lock table.
    Local(OwnedMutexGuard<()>),
}

/// Handle for a held (or being acquired) session lock.
///
/// Obtain one from [`SessionLockRepo::acquire_session_lock`] and hand it back to
/// [`SessionLockRepo::release_session_lock`]. The locked read/write methods
/// take the handle, so only the holder can perform them.
///
/// [`SessionLockRepo::acquire_session_lock`]: crate::repos::SessionLockRepo::acquire_session_lock
/// [`SessionLockRepo::release_session_lock`]: crate::repos::SessionLockRepo::release_session_lock
pub struct SessionLock {
    session_id: String,
    key: i64,
    held: Option<HeldLock>,
    acquired: bool,
}

impl SessionLock {
    pub(crate) fn new(session_id: &str, key: i64, held: HeldLock) -> Self {
        Self {
            session_id: session_id.to_string(),
            key,
            held: Some(held),
            acquired: false,
        }
    }

    /// Session identifier this lock covers.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Numeric advisory lock key.
    pub fn key(&self) -> i64 {
        self.key
    }

    /// Whether the backend granted the lock.
    pub fn is_acquired(&self) -> bool {
        self.acquired && self.held.is_some()
    }

    pub(crate) fn mark_acquired(&mut self) {
        self.acquired = true;
    }

    /// Connection holding a PostgreSQL advisory lock.
    pub(crate) fn postgres_conn(&mut self) -> MetadataResult<&mut PoolConnection<Postgres>> {
        match self.held.as_mut() {
            Some(HeldLock::Postgres(conn)) => Ok(conn),
            _ => Err(MetadataError::Lock {
                session_id: self.session_id.clone(),
                reason: "lock is not held on a PostgreSQL connection".to_string(),
            }),
        }
    }

    /// Ensure the lock is currently held, for backends that do not need the
    /// underlying resource to run queries.
    pub(crate) fn ensure_held(&self) -> MetadataResult<()> {
        if self.is_acquired() {
            Ok(())
        } else {
            Err(MetadataError::Lock {
                session_id: self.session_id.clone(),
                reason: "lock is not held".to_string(),
            })
        }
    }

    /// Detach the held resource, leaving the handle released.
    pub(crate) fn take(&mut self) -> Option<HeldLock> {
        self.acquired = false;
        self.held.take()
    }
}

impl std::fmt::Debug for SessionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLock")
            .field("session_id", &self.session_id)
            .field("key", &self.key)
            .field("acquired", &self.is_acquired())
            .finish()
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let acquired = self.acquired;
        match self.held.take() {
            Some(HeldLock::Postgres(mut conn)) => {
                if acquired {
                    tracing::warn!(
                        session_id = %self.session_id,
                        lock_key = self.key,
                        "session lock dropped without release; closing its connection"
                    );
                }
                // The lock query may still be in flight; never hand this
                // connection back to the pool.
                conn.close_on_drop();
            }
            Some(HeldLock::Local(_guard)) => {}
            None => {}
        }
    }
}

/// In-process table of per-key async mutexes.
#[derive(Default)]
pub(crate) struct LocalLockTable {
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalLockTable {
    /// Wait for exclusive ownership of `key`.
    pub(crate) async fn lock(&self, key: i64) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries only referenced by the table have no holder or waiter.
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks.entry(key).or_default().clone()
        };
        mutex.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lock_key_is_stable() {
        assert_eq!(lock_key("session-1"), -6140491553893954059);
        assert_eq!(lock_key("session-1"), lock_key("session-1"));
        assert_ne!(lock_key("session-1"), lock_key("session-2"));
    }

    #[tokio::test]
    async fn test_local_lock_table_excludes_same_key() {
        let table = Arc::new(LocalLockTable::default());
        let guard = table.lock(7).await;

        let contender = {
            let table = table.clone();
            tokio::spawn(async move {
                let _guard = table.lock(7).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished(), "second holder must wait");

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender should acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_local_lock_table_independent_keys() {
        let table = LocalLockTable::default();
        let _a = table.lock(1).await;
        let b = tokio::time::timeout(Duration::from_millis(100), table.lock(2)).await;
        assert!(b.is_ok(), "distinct keys must not contend");
    }

    #[tokio::test]
    async fn test_local_lock_table_prunes_idle_entries() {
        let table = LocalLockTable::default();
        drop(table.lock(1).await);
        drop(table.lock(2).await);
        let _held = table.lock(3).await;
        assert_eq!(table.len(), 1);
    }
}
