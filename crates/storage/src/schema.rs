use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, unixepoch())",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS oplog (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    target TEXT NOT NULL,
    op_type TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    correlation BLOB,
    correlation_kind TEXT,
    row_index INTEGER,
    batch_id BLOB CHECK (batch_id IS NULL OR length(batch_id) = 16),
    transaction_id BLOB CHECK (transaction_id IS NULL OR length(transaction_id) = 16),
    conflicted BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_oplog_target ON oplog (target, created_at, seq);
CREATE INDEX IF NOT EXISTS idx_oplog_batch ON oplog (batch_id) WHERE batch_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_oplog_transaction ON oplog (transaction_id) WHERE transaction_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_oplog_created ON oplog (created_at, seq);

CREATE TABLE IF NOT EXISTS blocks (
    block_id TEXT PRIMARY KEY,
    row_index INTEGER NOT NULL,
    doc TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    cached_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_blocks_row ON blocks (row_index);
";
