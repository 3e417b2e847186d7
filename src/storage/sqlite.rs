//! SQLite implementation of the message store.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::message::{EndpointId, Envelope, MessageId};

use super::schema::{
    Inbox, Outbox, CREATE_INBOX_TABLE, CREATE_OUTBOX_PENDING_INDEX, CREATE_OUTBOX_TABLE,
};
use super::{InboxRecord, MessageStore, OutboxRecord, Result, StoreError, StoreTransaction};

/// SQLite-backed [`MessageStore`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_INBOX_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_OUTBOX_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_OUTBOX_PENDING_INDEX)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn encode_timestamp(at: DateTime<Utc>) -> String {
    // Fixed-width form so stored timestamps compare correctly as text.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("invalid stored timestamp '{raw}': {e}")))
}

fn decode_endpoint(raw: &str) -> Result<EndpointId> {
    EndpointId::from_storage_key(raw)
        .ok_or_else(|| StoreError::Backend(format!("invalid stored endpoint key '{raw}'")))
}

fn inbox_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<InboxRecord> {
    let envelope_json: String = row.get("envelope");
    let envelope: Envelope = serde_json::from_str(&envelope_json)?;
    let endpoint_key: String = row.get("endpoint");
    let is_error: i64 = row.get("is_error");
    let handled: i64 = row.get("handled");

    Ok(InboxRecord {
        message_id: *envelope.id(),
        endpoint: decode_endpoint(&endpoint_key)?,
        envelope,
        is_error: is_error != 0,
        handled: handled != 0,
    })
}

fn outbox_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<OutboxRecord> {
    let id: String = row.get("id");
    let envelope_json: String = row.get("envelope");
    let envelope: Envelope = serde_json::from_str(&envelope_json)?;
    let endpoint_key: String = row.get("endpoint");
    let created_at: String = row.get("created_at");
    let sent: i64 = row.get("sent");

    Ok(OutboxRecord {
        id: Uuid::parse_str(&id)
            .map_err(|e| StoreError::Backend(format!("invalid stored outbox id '{id}': {e}")))?,
        endpoint: decode_endpoint(&endpoint_key)?,
        envelope,
        timestamp: decode_timestamp(&created_at)?,
        sent: sent != 0,
    })
}

struct SqliteTransaction {
    tx: sqlx::Transaction<'static, sqlx::Sqlite>,
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn find_inbox(
        &mut self,
        id: &MessageId,
        endpoint: &EndpointId,
    ) -> Result<Option<InboxRecord>> {
        let query = Query::select()
            .columns([Inbox::Endpoint, Inbox::Envelope, Inbox::IsError, Inbox::Handled])
            .from(Inbox::Table)
            .and_where(Expr::col(Inbox::MessageId).eq(id.to_string()))
            .and_where(Expr::col(Inbox::Endpoint).eq(endpoint.storage_key()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(inbox_from_row).transpose()
    }

    async fn insert_inbox(&mut self, record: &InboxRecord) -> Result<()> {
        let envelope_json = serde_json::to_string(&record.envelope)?;
        let query = Query::insert()
            .into_table(Inbox::Table)
            .columns([
                Inbox::MessageId,
                Inbox::Endpoint,
                Inbox::Envelope,
                Inbox::IsError,
                Inbox::Handled,
            ])
            .values_panic([
                record.message_id.to_string().into(),
                record.endpoint.storage_key().into(),
                envelope_json.into(),
                (record.is_error as i32).into(),
                (record.handled as i32).into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn set_inbox_handled(&mut self, id: &MessageId, endpoint: &EndpointId) -> Result<()> {
        let query = Query::update()
            .table(Inbox::Table)
            .value(Inbox::Handled, 1)
            .and_where(Expr::col(Inbox::MessageId).eq(id.to_string()))
            .and_where(Expr::col(Inbox::Endpoint).eq(endpoint.storage_key()))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn upsert_inbox_error(&mut self, record: &InboxRecord) -> Result<()> {
        let envelope_json = serde_json::to_string(&record.envelope)?;
        let query = Query::insert()
            .into_table(Inbox::Table)
            .columns([
                Inbox::MessageId,
                Inbox::Endpoint,
                Inbox::Envelope,
                Inbox::IsError,
                Inbox::Handled,
            ])
            .values_panic([
                record.message_id.to_string().into(),
                record.endpoint.storage_key().into(),
                envelope_json.into(),
                1.into(),
                (record.handled as i32).into(),
            ])
            .on_conflict(
                OnConflict::columns([Inbox::MessageId, Inbox::Endpoint])
                    .update_columns([Inbox::IsError, Inbox::Envelope])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn insert_outbox(&mut self, record: &OutboxRecord) -> Result<()> {
        let envelope_json = serde_json::to_string(&record.envelope)?;
        let query = Query::insert()
            .into_table(Outbox::Table)
            .columns([
                Outbox::Id,
                Outbox::Endpoint,
                Outbox::Envelope,
                Outbox::CreatedAt,
                Outbox::Sent,
            ])
            .values_panic([
                record.id.to_string().into(),
                record.endpoint.storage_key().into(),
                envelope_json.into(),
                encode_timestamp(record.timestamp).into(),
                (record.sent as i32).into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    async fn find_inbox(
        &self,
        id: &MessageId,
        endpoint: &EndpointId,
    ) -> Result<Option<InboxRecord>> {
        let query = Query::select()
            .columns([Inbox::Endpoint, Inbox::Envelope, Inbox::IsError, Inbox::Handled])
            .from(Inbox::Table)
            .and_where(Expr::col(Inbox::MessageId).eq(id.to_string()))
            .and_where(Expr::col(Inbox::Endpoint).eq(endpoint.storage_key()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(inbox_from_row).transpose()
    }

    async fn outbox_for_message(&self, id: &MessageId) -> Result<Vec<OutboxRecord>> {
        // Envelope ids are not a dedicated column; filter on the decoded
        // envelope. Inspection-only, not on the delivery path.
        let query = Query::select()
            .columns([
                Outbox::Id,
                Outbox::Endpoint,
                Outbox::Envelope,
                Outbox::CreatedAt,
                Outbox::Sent,
            ])
            .from(Outbox::Table)
            .order_by(Outbox::CreatedAt, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let mut records = Vec::new();
        for row in &rows {
            let record = outbox_from_row(row)?;
            if record.envelope.id() == id {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn unsent_outbox(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<Vec<OutboxRecord>> {
        let query = Query::select()
            .columns([
                Outbox::Id,
                Outbox::Endpoint,
                Outbox::Envelope,
                Outbox::CreatedAt,
                Outbox::Sent,
            ])
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::Sent).eq(0))
            .and_where(Expr::col(Outbox::CreatedAt).lte(encode_timestamp(cutoff)))
            .order_by(Outbox::CreatedAt, Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(outbox_from_row(row)?);
        }
        Ok(records)
    }

    async fn mark_outbox_sent(&self, id: &Uuid) -> Result<()> {
        let query = Query::update()
            .table(Outbox::Table)
            .value(Outbox::Sent, 1)
            .and_where(Expr::col(Outbox::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }
}
