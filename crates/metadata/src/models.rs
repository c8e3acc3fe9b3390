//! Database models mapping to the metadata schema.

use recall_core::Metadata;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Session record.
#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub uuid: Uuid,
    pub session_id: String,
    /// Stored as JSONB on PostgreSQL and JSON text on SQLite.
    #[sqlx(json)]
    pub metadata: Metadata,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    /// Soft-delete marker. A deleted session keeps its row but rejects writes.
    pub deleted_at: Option<OffsetDateTime>,
}

impl SessionRow {
    /// Whether the session has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
