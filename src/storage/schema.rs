//! Table identifiers and DDL for the SQLite store.

use sea_query::Iden;

/// Inbox table schema.
#[derive(Iden)]
pub enum Inbox {
    Table,
    #[iden = "message_id"]
    MessageId,
    #[iden = "endpoint"]
    Endpoint,
    #[iden = "envelope"]
    Envelope,
    #[iden = "is_error"]
    IsError,
    #[iden = "handled"]
    Handled,
}

/// Outbox table schema.
#[derive(Iden)]
pub enum Outbox {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "endpoint"]
    Endpoint,
    #[iden = "envelope"]
    Envelope,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "sent"]
    Sent,
}

pub const CREATE_INBOX_TABLE: &str = "
CREATE TABLE IF NOT EXISTS inbox (
    message_id TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    envelope TEXT NOT NULL,
    is_error INTEGER NOT NULL DEFAULT 0,
    handled INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (message_id, endpoint)
)";

pub const CREATE_OUTBOX_TABLE: &str = "
CREATE TABLE IF NOT EXISTS outbox (
    id TEXT PRIMARY KEY,
    endpoint TEXT NOT NULL,
    envelope TEXT NOT NULL,
    created_at TEXT NOT NULL,
    sent INTEGER NOT NULL DEFAULT 0
)";

// Index for sweep queries over unsent rows.
pub const CREATE_OUTBOX_PENDING_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_outbox_sent_created_at ON outbox (sent, created_at)";
