//! In-memory message store for tests and standalone use.
//!
//! Transactions stage their writes and apply them atomically on commit, so
//! rollback semantics match the durable backends.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::message::{EndpointId, MessageId};

use super::{InboxRecord, MessageStore, OutboxRecord, Result, StoreTransaction};

type InboxKey = (MessageId, String);

#[derive(Default)]
struct Inner {
    inbox: HashMap<InboxKey, InboxRecord>,
    outbox: HashMap<Uuid, OutboxRecord>,
}

enum Op {
    InsertInbox(InboxRecord),
    SetInboxHandled(InboxKey),
    UpsertInboxError(InboxRecord),
    InsertOutbox(OutboxRecord),
}

/// In-memory implementation of [`MessageStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all inbox records, for assertions and inspection.
    pub async fn inbox_records(&self) -> Vec<InboxRecord> {
        self.inner.lock().await.inbox.values().cloned().collect()
    }

    /// Snapshot of all outbox records, for assertions and inspection.
    pub async fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.inner.lock().await.outbox.values().cloned().collect()
    }
}

struct MemoryTransaction {
    inner: Arc<Mutex<Inner>>,
    staged: Vec<Op>,
}

impl MemoryTransaction {
    /// Staged view of one inbox record: committed state with this
    /// transaction's writes applied on top.
    fn staged_inbox(&self, committed: Option<InboxRecord>, key: &InboxKey) -> Option<InboxRecord> {
        let mut current = committed;
        for op in &self.staged {
            match op {
                Op::InsertInbox(rec) if (rec.message_id, rec.endpoint.storage_key()) == *key => {
                    current = Some(rec.clone());
                }
                Op::SetInboxHandled(k) if k == key => {
                    if let Some(rec) = current.as_mut() {
                        rec.handled = true;
                    }
                }
                Op::UpsertInboxError(rec)
                    if (rec.message_id, rec.endpoint.storage_key()) == *key =>
                {
                    let handled = current.as_ref().map(|r| r.handled).unwrap_or(false);
                    let mut rec = rec.clone();
                    rec.handled = handled;
                    current = Some(rec);
                }
                _ => {}
            }
        }
        current
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn find_inbox(
        &mut self,
        id: &MessageId,
        endpoint: &EndpointId,
    ) -> Result<Option<InboxRecord>> {
        let key = (*id, endpoint.storage_key());
        let committed = self.inner.lock().await.inbox.get(&key).cloned();
        Ok(self.staged_inbox(committed, &key))
    }

    async fn insert_inbox(&mut self, record: &InboxRecord) -> Result<()> {
        self.staged.push(Op::InsertInbox(record.clone()));
        Ok(())
    }

    async fn set_inbox_handled(&mut self, id: &MessageId, endpoint: &EndpointId) -> Result<()> {
        self.staged
            .push(Op::SetInboxHandled((*id, endpoint.storage_key())));
        Ok(())
    }

    async fn upsert_inbox_error(&mut self, record: &InboxRecord) -> Result<()> {
        self.staged.push(Op::UpsertInboxError(record.clone()));
        Ok(())
    }

    async fn insert_outbox(&mut self, record: &OutboxRecord) -> Result<()> {
        self.staged.push(Op::InsertOutbox(record.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for op in self.staged {
            match op {
                Op::InsertInbox(rec) => {
                    inner
                        .inbox
                        .insert((rec.message_id, rec.endpoint.storage_key()), rec);
                }
                Op::SetInboxHandled(key) => {
                    if let Some(rec) = inner.inbox.get_mut(&key) {
                        rec.handled = true;
                    }
                }
                Op::UpsertInboxError(mut rec) => {
                    let key = (rec.message_id, rec.endpoint.storage_key());
                    if let Some(existing) = inner.inbox.get(&key) {
                        rec.handled = existing.handled;
                    }
                    inner.inbox.insert(key, rec);
                }
                Op::InsertOutbox(rec) => {
                    inner.outbox.insert(rec.id, rec);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        // Staged writes are simply dropped.
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            staged: Vec::new(),
        }))
    }

    async fn find_inbox(
        &self,
        id: &MessageId,
        endpoint: &EndpointId,
    ) -> Result<Option<InboxRecord>> {
        let key = (*id, endpoint.storage_key());
        Ok(self.inner.lock().await.inbox.get(&key).cloned())
    }

    async fn outbox_for_message(&self, id: &MessageId) -> Result<Vec<OutboxRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .outbox
            .values()
            .filter(|rec| rec.envelope.id() == id)
            .cloned()
            .collect())
    }

    async fn unsent_outbox(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<Vec<OutboxRecord>> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<OutboxRecord> = inner
            .outbox
            .values()
            .filter(|rec| !rec.sent && rec.timestamp <= cutoff)
            .cloned()
            .collect();
        pending.sort_by_key(|rec| rec.timestamp);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn mark_outbox_sent(&self, id: &Uuid) -> Result<()> {
        if let Some(rec) = self.inner.lock().await.outbox.get_mut(id) {
            rec.sent = true;
        }
        Ok(())
    }
}
