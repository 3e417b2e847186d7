//! Persistence contract for inbox/outbox records.
//!
//! The bus consumes storage through a narrow transactional interface:
//! a `MessageStore` hands out `StoreTransaction`s for the unit-of-work step,
//! plus the non-transactional reads the background sweep needs. Shipped
//! backends: in-memory (tests, standalone) and SQLite (feature `sqlite`,
//! on by default).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::message::{EndpointId, Envelope, Header, MessageId};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend failed: {0}")]
    Backend(String),

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    #[error("failed to encode stored message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("unknown storage type: {0}")]
    UnknownBackend(String),
}

/// Deduplication ledger row: whether a message has been handled by an
/// endpoint. `handled` and `is_error` are the only mutable fields, each set
/// at most once.
#[derive(Debug, Clone)]
pub struct InboxRecord {
    pub message_id: MessageId,
    pub endpoint: EndpointId,
    pub envelope: Envelope,
    pub is_error: bool,
    pub handled: bool,
}

impl InboxRecord {
    /// Record created on first sight of a message for an endpoint.
    pub fn first_seen(envelope: &Envelope, endpoint: &EndpointId) -> Self {
        Self {
            message_id: *envelope.id(),
            endpoint: endpoint.clone(),
            envelope: envelope.clone(),
            is_error: false,
            handled: false,
        }
    }

    /// Record marking a message as permanently failed.
    pub fn rejected(envelope: &Envelope, endpoint: &EndpointId, reason: &str) -> Self {
        let mut envelope = envelope.clone();
        envelope
            .headers_mut()
            .set(Header::RejectReason(reason.to_string()));
        Self {
            message_id: *envelope.id(),
            endpoint: endpoint.clone(),
            envelope,
            is_error: true,
            handled: false,
        }
    }
}

/// Transactional buffer row for a message produced during handling. `sent`
/// transitions false→true only after the transport accepted the message.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub endpoint: EndpointId,
    pub envelope: Envelope,
    pub timestamp: DateTime<Utc>,
    pub sent: bool,
}

impl OutboxRecord {
    pub fn pending(envelope: &Envelope, endpoint: &EndpointId) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint: endpoint.clone(),
            envelope: envelope.clone(),
            timestamp: Utc::now(),
            sent: false,
        }
    }
}

/// One unit-of-work transaction over inbox and outbox state.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn find_inbox(
        &mut self,
        id: &MessageId,
        endpoint: &EndpointId,
    ) -> Result<Option<InboxRecord>>;

    async fn insert_inbox(&mut self, record: &InboxRecord) -> Result<()>;

    /// Set `handled = true` for an existing record.
    async fn set_inbox_handled(&mut self, id: &MessageId, endpoint: &EndpointId) -> Result<()>;

    /// Insert-or-update a record with `is_error = true`, preserving an
    /// existing `handled` flag.
    async fn upsert_inbox_error(&mut self, record: &InboxRecord) -> Result<()>;

    async fn insert_outbox(&mut self, record: &OutboxRecord) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Storage backend for the delivery ledger.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Non-transactional read for operational inspection.
    async fn find_inbox(
        &self,
        id: &MessageId,
        endpoint: &EndpointId,
    ) -> Result<Option<InboxRecord>>;

    /// Outbox rows produced for a message id, for operational inspection.
    async fn outbox_for_message(&self, id: &MessageId) -> Result<Vec<OutboxRecord>>;

    /// Unsent outbox rows created at or before `cutoff`, oldest first.
    async fn unsent_outbox(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<Vec<OutboxRecord>>;

    /// Follow-up write after the transport accepted an outbox message.
    async fn mark_outbox_sent(&self, id: &Uuid) -> Result<()>;
}

/// Initialize storage based on configuration.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn MessageStore>> {
    info!(storage = %config.storage_type, path = %config.path, "Initializing message store");

    match config.storage_type.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
            }

            let pool =
                sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.path)).await?;
            let store = SqliteStore::new(pool);
            store.init().await?;
            Ok(Arc::new(store))
        }
        other => Err(StoreError::UnknownBackend(other.to_string())),
    }
}
