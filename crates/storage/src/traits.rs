use gridsync_core::{
    block::Block,
    ids::*,
    interval_set::RowRange,
    operations::{NewPendingOp, PendingOperation},
    time::Millis,
};

use crate::error::StorageError;

/// A remote Block as last seen by this client.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedBlock {
    pub block_id: BlockId,
    pub block: Block,
    pub cached_at: Millis,
}

/// Append-only durable queue of Pending Operations.
///
/// Every listing is ordered oldest first: by creation time, then by key.
pub trait OpLogStore {
    /// Persist `ops` in a single transaction, returning them with their keys.
    fn append_ops(&mut self, ops: &[NewPendingOp]) -> Result<Vec<PendingOperation>, StorageError>;

    fn get_op(&self, seq: OpSeq) -> Result<Option<PendingOperation>, StorageError>;

    fn all_ops(&self) -> Result<Vec<PendingOperation>, StorageError>;

    fn ops_for_target(&self, target: &DocPath) -> Result<Vec<PendingOperation>, StorageError>;

    fn ops_by_batch(&self, batch_id: BatchId) -> Result<Vec<PendingOperation>, StorageError>;

    fn ops_by_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<PendingOperation>, StorageError>;

    /// Operations created within `[from, to]`.
    fn ops_created_between(
        &self,
        from: Millis,
        to: Millis,
    ) -> Result<Vec<PendingOperation>, StorageError>;

    /// Distinct targets with pending work, ordered by their oldest operation.
    fn pending_targets(&self) -> Result<Vec<DocPath>, StorageError>;

    /// Rewrite the payload, correlation and conflict set of an existing op.
    fn update_op(&mut self, op: &PendingOperation) -> Result<(), StorageError>;

    /// Delete in a single transaction. Returns how many rows were removed.
    fn delete_ops(&mut self, seqs: &[OpSeq]) -> Result<usize, StorageError>;

    fn op_count(&self) -> Result<u64, StorageError>;
}

/// Local copy of remote Blocks, keyed by Block id with a row-index index.
pub trait BlockStore {
    fn put_blocks(&mut self, blocks: &[CachedBlock]) -> Result<(), StorageError>;

    /// `None` when absent or stored in an unrecognized format.
    fn get_block(&self, block_id: &BlockId) -> Result<Option<CachedBlock>, StorageError>;

    /// Blocks whose row lies in `range`, ascending by row. Blocks stored in an
    /// unrecognized format are skipped.
    fn blocks_in_rows(&self, range: RowRange) -> Result<Vec<CachedBlock>, StorageError>;

    fn delete_block(&mut self, block_id: &BlockId) -> Result<(), StorageError>;
}
