//! Persist-then-send delivery of Pending Operations and their replay after
//! reconnecting.
//!
//! Every write is appended to the Operation Log before it is sent and is
//! removed only once the remote store confirms it. Replay walks the log
//! target by target, oldest first, and picks a strategy from the op's
//! correlation:
//!
//! * no correlation: send as-is;
//! * Row Range Record update: union with the remote record, then write;
//! * cell edit: per-field last-writer-wins against the remote Block.

use std::collections::BTreeSet;

use tracing::{debug, error, info, warn};

use gridsync_core::{
    block::{Block, UPDATED_KEY},
    error::CoreError,
    field_ops::{FieldOp, FieldPath},
    ids::{DocPath, OpSeq},
    operations::{Correlation, NewPendingOp, PendingOperation, RemoteWrite},
    row_range::RowRangeTracker,
    time::Millis,
};
use gridsync_storage::OpLogStore;

use crate::config::SheetPaths;
use crate::error::EngineError;
use crate::network::NetworkMonitor;
use crate::remote::{RemoteStore, write_one};
use crate::row_cache::RowCache;

/// Outcome of sending freshly flushed operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub confirmed: Vec<OpSeq>,
    /// Left in the log because the remote was unreachable.
    pub deferred: Vec<OpSeq>,
    /// Rejected by the remote; left in the log for replay to sort out.
    pub failed: Vec<OpSeq>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub resolved_fields: usize,
    pub conflicted_fields: usize,
    /// Operations that failed permanently in this pass. They stay in the log.
    pub failed: Vec<OpSeq>,
    /// The pass stopped early because the remote became unreachable.
    pub interrupted: bool,
}

/// Per-field verdict of a cell edit against the remote Block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldDecision {
    pub resolved: BTreeSet<String>,
    pub conflicted: BTreeSet<String>,
}

/// Split the columns of a cell-edit op into those it may write and those the
/// remote has since overwritten.
///
/// A column is resolved when the remote Block is missing, the Block as a
/// whole predates the op, the column has no remote version, or its version
/// predates the op. A version equal to the op's creation time with an equal
/// value is this op's own earlier delivery and also counts as resolved.
pub fn classify_fields(op: &PendingOperation, remote: Option<&Block>) -> FieldDecision {
    let columns = op.columns();
    let block = match remote {
        Some(block) if block.updated_at >= op.created_at => block,
        _ => {
            return FieldDecision {
                resolved: columns,
                conflicted: BTreeSet::new(),
            };
        }
    };

    let mut decision = FieldDecision::default();
    for column in columns {
        let resolved = match block.field_version(&column) {
            None => true,
            Some(version) if version < op.created_at => true,
            Some(version) if version == op.created_at => {
                op.cell_value(&column) == Some(block.data.get(&column).cloned())
            }
            Some(_) => false,
        };
        if resolved {
            decision.resolved.insert(column);
        } else {
            decision.conflicted.insert(column);
        }
    }
    decision
}

/// Raise the Block updated-at stamp of a patch to at least `floor`.
fn stamp_not_before(write: RemoteWrite, floor: Millis) -> RemoteWrite {
    match write {
        RemoteWrite::Patch { path, ops } => RemoteWrite::Patch {
            path,
            ops: ops
                .into_iter()
                .map(|op| match op {
                    FieldOp::Set { path, value }
                        if path == FieldPath::key(UPDATED_KEY)
                            && value.as_u64().is_some_and(|u| u < floor) =>
                    {
                        FieldOp::set(path, floor)
                    }
                    other => other,
                })
                .collect(),
        },
        other => other,
    }
}

#[derive(Debug, Default)]
struct OpOutcome {
    resolved: usize,
    conflicted: usize,
}

pub struct SyncEngine<R, S> {
    remote: R,
    store: S,
    network: NetworkMonitor,
    paths: SheetPaths,
}

impl<R: RemoteStore, S: OpLogStore> SyncEngine<R, S> {
    pub fn new(remote: R, store: S, network: NetworkMonitor, paths: SheetPaths) -> Self {
        Self {
            remote,
            store,
            network,
            paths,
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn remote_mut(&mut self) -> &mut R {
        &mut self.remote
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn is_online(&self) -> bool {
        self.network.is_online()
    }

    pub fn pending_count(&self) -> Result<u64, EngineError> {
        Ok(self.store.op_count()?)
    }

    /// Append operations to the log. Nothing is sent.
    pub fn persist(&mut self, ops: &[NewPendingOp]) -> Result<Vec<PendingOperation>, EngineError> {
        let persisted = self.store.append_ops(ops)?;
        debug!(count = persisted.len(), "persisted pending operations");
        Ok(persisted)
    }

    /// Send freshly persisted operations. Cell edits go out as one atomic
    /// batch per batch id; Row Range Record updates are merged with the
    /// remote record first.
    pub fn push(
        &mut self,
        ops: Vec<PendingOperation>,
        cache: &mut RowCache,
        rows: &mut RowRangeTracker,
    ) -> Result<PushReport, EngineError> {
        let mut report = PushReport::default();
        if !self.network.is_online() {
            debug!(count = ops.len(), "offline; operations stay queued");
            report.deferred = ops.iter().map(|op| op.seq).collect();
            return Ok(report);
        }

        let pushing: BTreeSet<OpSeq> = ops.iter().map(|op| op.seq).collect();
        let (range_ops, cell_ops): (Vec<_>, Vec<_>) = ops
            .into_iter()
            .partition(|op| matches!(op.correlation, Some(Correlation::RowRanges { .. })));

        let mut unreachable = false;
        for batch in cell_ops.chunk_by(|a, b| a.batch_id == b.batch_id) {
            let seqs: Vec<OpSeq> = batch.iter().map(|op| op.seq).collect();
            if unreachable {
                report.deferred.extend(seqs);
                continue;
            }
            if self.waits_on_older(batch, &pushing)? {
                debug!(count = seqs.len(), "older operations on the same target pending; left for replay");
                report.deferred.extend(seqs);
                continue;
            }
            let writes: Vec<RemoteWrite> = batch.iter().map(|op| op.write.clone()).collect();
            match self.remote.batch_write(&writes) {
                Ok(()) => {
                    self.confirm(batch, cache)?;
                    report.confirmed.extend(seqs);
                }
                Err(err) if err.is_transient() => {
                    warn!(error = %err, count = seqs.len(), "batch write failed; left queued");
                    unreachable = true;
                    report.deferred.extend(seqs);
                }
                Err(err) => {
                    warn!(error = %err, count = seqs.len(), "batch write rejected; left for replay");
                    report.failed.extend(seqs);
                }
            }
        }

        for op in range_ops {
            if unreachable {
                report.deferred.push(op.seq);
                continue;
            }
            match self.merge_row_ranges(&op, rows) {
                Ok(()) => report.confirmed.push(op.seq),
                Err(err) if err.is_transient() => {
                    warn!(error = %err, seq = %op.seq, "row range update failed; left queued");
                    unreachable = true;
                    report.deferred.push(op.seq);
                }
                Err(EngineError::Remote(err)) => {
                    warn!(error = %err, seq = %op.seq, "row range update rejected");
                    report.failed.push(op.seq);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }

    /// True when a target of `batch` still has older operations in the log
    /// that replay would send. Conflicted ops waiting on a resolution do not
    /// hold newer writes back.
    fn waits_on_older(
        &self,
        batch: &[PendingOperation],
        pushing: &BTreeSet<OpSeq>,
    ) -> Result<bool, EngineError> {
        for op in batch {
            let blocked = self.store.ops_for_target(op.target())?.iter().any(|older| {
                older.seq < op.seq && !pushing.contains(&older.seq) && !older.awaits_resolution()
            });
            if blocked {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Replay every pending operation, target by target, oldest first.
    pub fn replay(
        &mut self,
        cache: &mut RowCache,
        rows: &mut RowRangeTracker,
    ) -> Result<ReplayReport, EngineError> {
        let mut report = ReplayReport::default();
        if !self.network.is_online() {
            return Ok(report);
        }

        'targets: for target in self.store.pending_targets()? {
            for op in self.store.ops_for_target(&target)? {
                if op.awaits_resolution() {
                    report.conflicted_fields += op.conflicted.len();
                    continue;
                }
                let seq = op.seq;
                match self.replay_one(op, cache, rows) {
                    Ok(outcome) => {
                        report.replayed += 1;
                        report.resolved_fields += outcome.resolved;
                        report.conflicted_fields += outcome.conflicted;
                    }
                    Err(err) if err.is_transient() => {
                        warn!(error = %err, %target, "replay interrupted");
                        report.interrupted = true;
                        break 'targets;
                    }
                    Err(err) => {
                        error!(error = %err, %seq, %target, "replay of operation failed");
                        report.failed.push(seq);
                    }
                }
            }
        }

        if report.replayed > 0 || !report.failed.is_empty() || report.conflicted_fields > 0 {
            info!(
                replayed = report.replayed,
                resolved = report.resolved_fields,
                conflicted = report.conflicted_fields,
                failed = report.failed.len(),
                "replay finished"
            );
        }
        Ok(report)
    }

    fn replay_one(
        &mut self,
        op: PendingOperation,
        cache: &mut RowCache,
        rows: &mut RowRangeTracker,
    ) -> Result<OpOutcome, EngineError> {
        match &op.correlation {
            None => {
                write_one(&mut self.remote, &op.write)?;
                self.store.delete_ops(&[op.seq])?;
                Ok(OpOutcome::default())
            }
            Some(Correlation::RowRanges { .. }) => {
                self.merge_row_ranges(&op, rows)?;
                Ok(OpOutcome::default())
            }
            Some(Correlation::CellEdit { .. }) => self.replay_cell_edit(op, cache),
        }
    }

    fn replay_cell_edit(
        &mut self,
        op: PendingOperation,
        cache: &mut RowCache,
    ) -> Result<OpOutcome, EngineError> {
        let remote = self.fetch_block(op.target())?;
        let decision = classify_fields(&op, remote.as_ref());

        // A create must not wipe fields of a Block that now exists remotely,
        // and the Block stamp never moves backwards.
        let write = match &remote {
            Some(block) => stamp_not_before(op.write.clone().into_block_patch()?, block.updated_at),
            None => op.write.clone(),
        };

        if decision.conflicted.is_empty() {
            write_one(&mut self.remote, &write)?;
            self.confirm(std::slice::from_ref(&op), cache)?;
            return Ok(OpOutcome {
                resolved: decision.resolved.len(),
                conflicted: 0,
            });
        }

        if !decision.resolved.is_empty() {
            write_one(&mut self.remote, &write.retain_columns(&decision.resolved)?)?;
            self.supersede_conflicts(op.target(), &decision.resolved, op.seq)?;
        }
        let row = op.row().unwrap_or_default();
        let rest = PendingOperation {
            write: op.write.retain_columns(&decision.conflicted)?,
            correlation: Some(Correlation::CellEdit {
                row,
                columns: decision.conflicted.clone(),
            }),
            conflicted: decision.conflicted.clone(),
            ..op.clone()
        };
        self.store.update_op(&rest)?;
        if let Some(entry) = cache.get_mut(row) {
            entry.mark_saved(&decision.resolved, op.created_at);
            entry.mark_conflicted(&decision.conflicted);
        }
        info!(
            seq = %op.seq,
            target = %op.target(),
            conflicted = ?decision.conflicted,
            "remote holds newer values; fields left unresolved"
        );
        Ok(OpOutcome {
            resolved: decision.resolved.len(),
            conflicted: decision.conflicted.len(),
        })
    }

    /// Union the op's ranges with the remote Row Range Record and write the
    /// result back.
    fn merge_row_ranges(
        &mut self,
        op: &PendingOperation,
        rows: &mut RowRangeTracker,
    ) -> Result<(), EngineError> {
        if let Some(doc) = self.remote.get(&self.paths.rows)? {
            match rows.merge_upstream(&doc) {
                Ok(added) => debug!(added, "merged remote row range record"),
                Err(err) => warn!(error = %err, "remote row range record unreadable; replacing it"),
            }
        }
        if let Some(Correlation::RowRanges { ranges }) = &op.correlation {
            for range in ranges {
                rows.mark_rows(*range);
            }
        }
        self.remote.create(&self.paths.rows, &rows.encode_for_save())?;
        self.store.delete_ops(&[op.seq])?;
        Ok(())
    }

    /// Remove confirmed ops from the log and clear the matching unsaved
    /// markers.
    fn confirm(&mut self, ops: &[PendingOperation], cache: &mut RowCache) -> Result<(), EngineError> {
        let seqs: Vec<OpSeq> = ops.iter().map(|op| op.seq).collect();
        self.store.delete_ops(&seqs)?;
        for op in ops {
            if let Some(Correlation::CellEdit { row, columns }) = &op.correlation {
                self.supersede_conflicts(op.target(), columns, op.seq)?;
                if let Some(entry) = cache.get_mut(*row) {
                    entry.mark_saved(columns, op.created_at);
                }
            }
        }
        debug!(count = seqs.len(), "confirmed operations");
        Ok(())
    }

    /// Read a Block document. A Block in an unrecognized format reads as
    /// absent.
    pub fn fetch_block(&mut self, path: &DocPath) -> Result<Option<Block>, EngineError> {
        let Some(doc) = self.remote.get(path)? else {
            return Ok(None);
        };
        match Block::from_value(&doc) {
            Ok(block) => Ok(Some(block)),
            Err(err @ CoreError::FormatMismatch { .. }) => {
                warn!(error = %err, %path, "treating block in unknown format as absent");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Drop a pending operation without sending it. The affected cells keep
    /// their local value but are no longer marked unsaved.
    pub fn discard(&mut self, seq: OpSeq, cache: &mut RowCache) -> Result<PendingOperation, EngineError> {
        let op = self
            .store
            .get_op(seq)?
            .ok_or(EngineError::OperationNotFound(seq))?;
        self.store.delete_ops(&[seq])?;
        if let Some(Correlation::CellEdit { row, columns }) = &op.correlation {
            if let Some(entry) = cache.get_mut(*row) {
                for column in columns {
                    entry.revert_cell(column, None);
                }
            }
        }
        warn!(%seq, target = %op.target(), "discarded pending operation");
        Ok(op)
    }

    /// Remove a conflicted column from every pending op on `target`. Ops left
    /// with no columns are deleted. Returns how many ops were touched.
    pub fn drop_conflicted_column(
        &mut self,
        target: &DocPath,
        column: &str,
    ) -> Result<usize, EngineError> {
        let columns = BTreeSet::from([column.to_string()]);
        self.drop_conflicted_columns(target, &columns, None)
    }

    /// A confirmed write of `columns` replaces older conflicted edits of the
    /// same columns.
    fn supersede_conflicts(
        &mut self,
        target: &DocPath,
        columns: &BTreeSet<String>,
        seq: OpSeq,
    ) -> Result<(), EngineError> {
        let dropped = self.drop_conflicted_columns(target, columns, Some(seq))?;
        if dropped > 0 {
            debug!(%target, %seq, dropped, "newer write superseded conflicted edits");
        }
        Ok(())
    }

    fn drop_conflicted_columns(
        &mut self,
        target: &DocPath,
        columns: &BTreeSet<String>,
        before: Option<OpSeq>,
    ) -> Result<usize, EngineError> {
        let mut touched = 0;
        for mut op in self.store.ops_for_target(target)? {
            if before.is_some_and(|seq| op.seq >= seq) {
                continue;
            }
            let dropped: BTreeSet<String> = op.conflicted.intersection(columns).cloned().collect();
            if dropped.is_empty() {
                continue;
            }
            touched += 1;
            op.conflicted.retain(|c| !dropped.contains(c));
            let remaining: BTreeSet<String> = op.columns().difference(&dropped).cloned().collect();
            if remaining.is_empty() {
                self.store.delete_ops(&[op.seq])?;
                continue;
            }
            op.write = op.write.retain_columns(&remaining)?;
            op.correlation = Some(Correlation::CellEdit {
                row: op.row().unwrap_or_default(),
                columns: remaining,
            });
            self.store.update_op(&op)?;
        }
        Ok(touched)
    }
}
