use std::collections::BTreeSet;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension};

use gridsync_core::{
    CoreError,
    block::Block,
    ids::*,
    interval_set::RowRange,
    operations::{Correlation, NewPendingOp, PendingOperation, RemoteWrite},
    time::Millis,
};

use crate::error::StorageError;
use crate::traits::{BlockStore, CachedBlock, OpLogStore};

const OP_COLUMNS: &str =
    "seq, payload, created_at, correlation, batch_id, transaction_id, conflicted";

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

/// Integer columns are signed; reject values that would wrap.
fn to_sql_int(value: u64, label: &'static str) -> Result<i64, StorageError> {
    i64::try_from(value).map_err(|_| StorageError::OutOfRange {
        label,
        value: value.to_string(),
    })
}

fn from_sql_int(value: i64, label: &'static str) -> Result<u64, StorageError> {
    u64::try_from(value).map_err(|_| StorageError::OutOfRange {
        label,
        value: value.to_string(),
    })
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    rmp_serde::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    rmp_serde::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn query_ops<P: rusqlite::Params>(
        &self,
        filter: &str,
        params: P,
    ) -> Result<Vec<PendingOperation>, StorageError> {
        let sql = format!("SELECT {OP_COLUMNS} FROM oplog {filter} ORDER BY created_at, seq");
        let mut stmt = self.conn.prepare(&sql)?;
        let ops = stmt
            .query_map(params, |row| read_op(row).map_err(tunnel))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ops)
    }
}

fn read_op(row: &rusqlite::Row) -> Result<PendingOperation, StorageError> {
    let seq: i64 = row.get(0)?;
    let payload: Vec<u8> = row.get(1)?;
    let created_at: i64 = row.get(2)?;
    let correlation: Option<Vec<u8>> = row.get(3)?;
    let batch_id: Option<Vec<u8>> = row.get(4)?;
    let transaction_id: Option<Vec<u8>> = row.get(5)?;
    let conflicted: Vec<u8> = row.get(6)?;

    let write: RemoteWrite = decode(&payload)?;
    let correlation: Option<Correlation> = correlation.as_deref().map(decode).transpose()?;
    let batch_id = batch_id
        .map(|b| to_array::<16>(b, "batch_id").map(BatchId::from_bytes))
        .transpose()?;
    let transaction_id = transaction_id
        .map(|b| to_array::<16>(b, "transaction_id").map(TransactionId::from_bytes))
        .transpose()?;
    let conflicted: BTreeSet<String> = decode(&conflicted)?;

    Ok(PendingOperation {
        seq: OpSeq(seq),
        write,
        created_at: from_sql_int(created_at, "created_at")?,
        correlation,
        batch_id,
        transaction_id,
        conflicted,
    })
}

fn read_block(row: &rusqlite::Row) -> Result<Option<CachedBlock>, StorageError> {
    let block_id: String = row.get(0)?;
    let doc: String = row.get(1)?;
    let cached_at: i64 = row.get(2)?;
    let value: serde_json::Value =
        serde_json::from_str(&doc).map_err(|e| StorageError::Serialization(e.to_string()))?;
    match Block::from_value(&value) {
        Ok(block) => Ok(Some(CachedBlock {
            block_id: BlockId::new(block_id),
            block,
            cached_at: from_sql_int(cached_at, "cached_at")?,
        })),
        Err(CoreError::FormatMismatch { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl OpLogStore for SqliteStorage {
    fn append_ops(&mut self, ops: &[NewPendingOp]) -> Result<Vec<PendingOperation>, StorageError> {
        let tx = self.conn.transaction()?;
        let mut stored = Vec::with_capacity(ops.len());
        let no_conflicts = encode(&BTreeSet::<String>::new())?;

        for op in ops {
            let correlation = op.correlation.as_ref().map(encode).transpose()?;
            tx.execute(
                "INSERT INTO oplog (target, op_type, payload, created_at, correlation, correlation_kind, row_index, batch_id, transaction_id, conflicted) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    op.write.path().as_str(),
                    op.write.kind_name(),
                    encode(&op.write)?,
                    to_sql_int(op.created_at, "created_at")?,
                    correlation,
                    op.correlation.as_ref().map(Correlation::kind_name),
                    op.correlation
                        .as_ref()
                        .and_then(Correlation::row)
                        .map(|r| to_sql_int(r, "row"))
                        .transpose()?,
                    op.batch_id.map(|b| b.as_bytes().to_vec()),
                    op.transaction_id.map(|t| t.as_bytes().to_vec()),
                    no_conflicts,
                ],
            )?;
            stored.push(PendingOperation {
                seq: OpSeq(tx.last_insert_rowid()),
                write: op.write.clone(),
                created_at: op.created_at,
                correlation: op.correlation.clone(),
                batch_id: op.batch_id,
                transaction_id: op.transaction_id,
                conflicted: BTreeSet::new(),
            });
        }

        tx.commit()?;
        Ok(stored)
    }

    fn get_op(&self, seq: OpSeq) -> Result<Option<PendingOperation>, StorageError> {
        Ok(self.query_ops("WHERE seq = ?1", rusqlite::params![seq.0])?.pop())
    }

    fn all_ops(&self) -> Result<Vec<PendingOperation>, StorageError> {
        self.query_ops("", [])
    }

    fn ops_for_target(&self, target: &DocPath) -> Result<Vec<PendingOperation>, StorageError> {
        self.query_ops("WHERE target = ?1", rusqlite::params![target.as_str()])
    }

    fn ops_by_batch(&self, batch_id: BatchId) -> Result<Vec<PendingOperation>, StorageError> {
        self.query_ops(
            "WHERE batch_id = ?1",
            rusqlite::params![batch_id.as_bytes().as_slice()],
        )
    }

    fn ops_by_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<PendingOperation>, StorageError> {
        self.query_ops(
            "WHERE transaction_id = ?1",
            rusqlite::params![transaction_id.as_bytes().as_slice()],
        )
    }

    fn ops_created_between(
        &self,
        from: Millis,
        to: Millis,
    ) -> Result<Vec<PendingOperation>, StorageError> {
        self.query_ops(
            "WHERE created_at BETWEEN ?1 AND ?2",
            rusqlite::params![to_sql_int(from, "from")?, to_sql_int(to, "to")?],
        )
    }

    fn pending_targets(&self) -> Result<Vec<DocPath>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT target FROM oplog GROUP BY target ORDER BY MIN(created_at), MIN(seq)",
        )?;
        let targets = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|t| t.map(DocPath::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(targets)
    }

    fn update_op(&mut self, op: &PendingOperation) -> Result<(), StorageError> {
        let correlation = op.correlation.as_ref().map(encode).transpose()?;
        let changed = self.conn.execute(
            "UPDATE oplog SET target = ?1, op_type = ?2, payload = ?3, correlation = ?4, correlation_kind = ?5, row_index = ?6, conflicted = ?7 WHERE seq = ?8",
            rusqlite::params![
                op.write.path().as_str(),
                op.write.kind_name(),
                encode(&op.write)?,
                correlation,
                op.correlation.as_ref().map(Correlation::kind_name),
                op.row().map(|r| to_sql_int(r, "row")).transpose()?,
                encode(&op.conflicted)?,
                op.seq.0,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("pending operation {}", op.seq)));
        }
        Ok(())
    }

    fn delete_ops(&mut self, seqs: &[OpSeq]) -> Result<usize, StorageError> {
        let tx = self.conn.transaction()?;
        let mut removed = 0;
        for seq in seqs {
            removed += tx.execute("DELETE FROM oplog WHERE seq = ?1", rusqlite::params![seq.0])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    fn op_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM oplog", [], |row| row.get(0))?;
        from_sql_int(count, "op count")
    }
}

impl BlockStore for SqliteStorage {
    fn put_blocks(&mut self, blocks: &[CachedBlock]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        for cached in blocks {
            let doc = serde_json::to_string(&cached.block.to_value()?)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            tx.execute(
                "INSERT OR REPLACE INTO blocks (block_id, row_index, doc, updated_at, cached_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    cached.block_id.as_str(),
                    to_sql_int(cached.block.row, "row")?,
                    doc,
                    to_sql_int(cached.block.updated_at, "updated_at")?,
                    to_sql_int(cached.cached_at, "cached_at")?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_block(&self, block_id: &BlockId) -> Result<Option<CachedBlock>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT block_id, doc, cached_at FROM blocks WHERE block_id = ?1")?;
        let found = stmt
            .query_row(rusqlite::params![block_id.as_str()], |row| {
                read_block(row).map_err(tunnel)
            })
            .optional()?;
        Ok(found.flatten())
    }

    fn blocks_in_rows(&self, range: RowRange) -> Result<Vec<CachedBlock>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT block_id, doc, cached_at FROM blocks WHERE row_index BETWEEN ?1 AND ?2 ORDER BY row_index",
        )?;
        let blocks = stmt
            .query_map(
                rusqlite::params![to_sql_int(range.lo, "row")?, to_sql_int(range.hi, "row")?],
                |row| read_block(row).map_err(tunnel),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(blocks.into_iter().flatten().collect())
    }

    fn delete_block(&mut self, block_id: &BlockId) -> Result<(), StorageError> {
        self.conn.execute(
            "DELETE FROM blocks WHERE block_id = ?1",
            rusqlite::params![block_id.as_str()],
        )?;
        Ok(())
    }
}

/// Tunnel a StorageError through rusqlite's error type inside row closures.
fn tunnel(e: StorageError) -> rusqlite::Error {
    match e {
        StorageError::Sqlite(sq) => sq,
        other => rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Blob,
            Box::new(OpaqueStorageError(other.to_string())),
        ),
    }
}

/// Wrapper error type used to tunnel StorageError through rusqlite's error system
/// in query_map closures that must return rusqlite::Error.
#[derive(Debug)]
struct OpaqueStorageError(String);

impl std::fmt::Display for OpaqueStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OpaqueStorageError {}

#[cfg(test)]
mod tests {
    use super::*;
    use gridsync_core::block::CellWrite;
    use serde_json::json;

    fn patch_op(target: &str, created_at: Millis, row: u64) -> NewPendingOp {
        NewPendingOp {
            write: RemoteWrite::Patch {
                path: DocPath::new(target),
                ops: Block::patch_for(
                    &[CellWrite {
                        column: "A".into(),
                        value: Some(json!(row)),
                        style: None,
                    }],
                    created_at,
                ),
            },
            created_at,
            correlation: Some(Correlation::CellEdit {
                row,
                columns: ["A".to_string()].into_iter().collect(),
            }),
            batch_id: None,
            transaction_id: None,
        }
    }

    #[test]
    fn append_assigns_increasing_keys() -> Result<(), StorageError> {
        let mut store = SqliteStorage::open_in_memory()?;
        let ops = store.append_ops(&[patch_op("s/b/1", 10, 1), patch_op("s/b/2", 11, 2)])?;
        assert!(ops[0].seq < ops[1].seq);
        assert_eq!(store.op_count()?, 2);
        assert_eq!(store.get_op(ops[1].seq)?, Some(ops[1].clone()));
        Ok(())
    }

    #[test]
    fn listings_are_oldest_first() -> Result<(), StorageError> {
        let mut store = SqliteStorage::open_in_memory()?;
        store.append_ops(&[patch_op("s/b/2", 30, 2)])?;
        store.append_ops(&[patch_op("s/b/1", 20, 1), patch_op("s/b/2", 10, 2)])?;

        let created: Vec<Millis> = store.all_ops()?.iter().map(|op| op.created_at).collect();
        assert_eq!(created, vec![10, 20, 30]);

        let targets = store.pending_targets()?;
        assert_eq!(targets, vec![DocPath::new("s/b/2"), DocPath::new("s/b/1")]);

        let for_two: Vec<Millis> = store
            .ops_for_target(&DocPath::new("s/b/2"))?
            .iter()
            .map(|op| op.created_at)
            .collect();
        assert_eq!(for_two, vec![10, 30]);
        assert_eq!(store.ops_created_between(15, 30)?.len(), 2);
        Ok(())
    }

    #[test]
    fn batch_and_transaction_lookup() -> Result<(), StorageError> {
        let mut store = SqliteStorage::open_in_memory()?;
        let batch = BatchId::new();
        let txn = TransactionId::new();
        let mut a = patch_op("s/b/1", 1, 1);
        a.batch_id = Some(batch);
        a.transaction_id = Some(txn);
        let mut b = patch_op("s/b/2", 2, 2);
        b.transaction_id = Some(txn);
        store.append_ops(&[a, b, patch_op("s/b/3", 3, 3)])?;

        assert_eq!(store.ops_by_batch(batch)?.len(), 1);
        assert_eq!(store.ops_by_transaction(txn)?.len(), 2);
        Ok(())
    }

    #[test]
    fn update_and_delete() -> Result<(), StorageError> {
        let mut store = SqliteStorage::open_in_memory()?;
        let mut op = store.append_ops(&[patch_op("s/b/1", 1, 1)])?.remove(0);
        op.conflicted.insert("A".into());
        store.update_op(&op)?;
        assert_eq!(store.get_op(op.seq)?.unwrap().conflicted, op.conflicted);

        assert_eq!(store.delete_ops(&[op.seq, OpSeq(999)])?, 1);
        assert!(store.get_op(op.seq)?.is_none());
        assert!(matches!(store.update_op(&op), Err(StorageError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn oplog_survives_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("grid.db");
        let seq = {
            let mut store = SqliteStorage::open(&path)?;
            store.append_ops(&[patch_op("s/b/1", 5, 1)])?[0].seq
        };
        let store = SqliteStorage::open(&path)?;
        let op = store.get_op(seq)?.expect("op persisted across sessions");
        assert_eq!(op.row(), Some(1));
        assert_eq!(op.cell_value("A"), Some(Some(json!(1))));
        Ok(())
    }

    #[test]
    fn block_cache_by_row() -> Result<(), StorageError> {
        let mut store = SqliteStorage::open_in_memory()?;
        let blocks: Vec<CachedBlock> = [(5u64, "b5"), (1, "b1"), (9, "b9")]
            .into_iter()
            .map(|(row, id)| CachedBlock {
                block_id: BlockId::new(id),
                block: Block::create_for(row, &[], 100),
                cached_at: 200,
            })
            .collect();
        store.put_blocks(&blocks)?;

        let rows: Vec<u64> = store
            .blocks_in_rows(RowRange::new(0, 5)?)?
            .iter()
            .map(|b| b.block.row)
            .collect();
        assert_eq!(rows, vec![1, 5]);
        assert_eq!(store.get_block(&BlockId::new("b9"))?.unwrap().block.row, 9);

        store.delete_block(&BlockId::new("b9"))?;
        assert!(store.get_block(&BlockId::new("b9"))?.is_none());
        Ok(())
    }

    #[test]
    fn unknown_block_format_reads_as_absent() -> Result<(), StorageError> {
        let store = SqliteStorage::open_in_memory()?;
        store.conn().execute(
            "INSERT INTO blocks (block_id, row_index, doc, updated_at, cached_at) VALUES ('old', 3, ?1, 0, 0)",
            rusqlite::params![json!({"format": "1", "r": 3}).to_string()],
        )?;
        assert!(store.get_block(&BlockId::new("old"))?.is_none());
        assert!(store.blocks_in_rows(RowRange::new(0, 10)?)?.is_empty());
        Ok(())
    }

    #[test]
    fn out_of_range_integers_are_rejected() -> Result<(), StorageError> {
        let mut store = SqliteStorage::open_in_memory()?;
        let err = store.append_ops(&[patch_op("s/blocks/a", u64::MAX, 0)]);
        assert!(matches!(err, Err(StorageError::OutOfRange { label: "created_at", .. })));
        assert_eq!(store.op_count()?, 0);

        let err = store.put_blocks(&[CachedBlock {
            block_id: BlockId::new("far"),
            block: Block::create_for(u64::MAX, &[], 100),
            cached_at: 200,
        }]);
        assert!(matches!(err, Err(StorageError::OutOfRange { label: "row", .. })));
        assert!(store.get_block(&BlockId::new("far"))?.is_none());
        Ok(())
    }
}
