pub mod config;
pub mod edit_collector;
pub mod error;
pub mod fetch_queue;
pub mod network;
pub mod presence;
pub mod remote;
pub mod row_cache;
pub mod sync;

pub use config::{DequeueOrder, FetchQueueConfig, PresenceConfig, SheetPaths, SyncConfig};
pub use edit_collector::CellEdit;
pub use error::EngineError;
pub use fetch_queue::TaskId;
pub use network::NetworkMonitor;
pub use remote::{DocChange, Predicate, Query, RemoteError, RemoteStore, SubscriptionId};
pub use row_cache::{CellState, RowEntry};
pub use sync::{PushReport, ReplayReport};

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, info, warn};

use gridsync_core::{
    block::{Block, ROW_KEY, UPDATED_KEY},
    field_ops::{FieldOp, FieldPath, apply_field_ops},
    ids::{BatchId, BlockId, ClientId, DocPath, OpSeq, TransactionId},
    interval_set::RowRange,
    operations::{NewPendingOp, PendingOperation, RemoteWrite},
    presence::{EditRect, PresenceEntry},
    row_range::RowRangeTracker,
    time::{Clock, Millis},
};
use gridsync_storage::{BlockStore, CachedBlock, OpLogStore};

use crate::edit_collector::{EditBatcher, EditCollector};
use crate::fetch_queue::{FetchQueue, FetchRequest};
use crate::network::ListenerId;
use crate::presence::{PresenceSync, column_ordinal};
use crate::row_cache::RowCache;
use crate::sync::SyncEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Re-send the local value with a fresh version so it wins.
    KeepMine,
    /// Drop the local edit and show the remote value.
    TakeTheirs,
}

/// What one call to [`GridSync::tick`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub flushed: Option<PushReport>,
    pub replay: Option<ReplayReport>,
    pub loaded_blocks: usize,
    pub remote_changes: usize,
}

/// Client-side sync layer for one sheet.
///
/// Single-threaded and driven by the host: edits and viewport requests are
/// recorded immediately, and all timer-driven work (debounced flushes,
/// fetches, replay retries, presence pings) happens in [`GridSync::tick`].
pub struct GridSync<R: RemoteStore, S: OpLogStore + BlockStore> {
    config: SyncConfig,
    paths: SheetPaths,
    clock: Rc<dyn Clock>,
    network: NetworkMonitor,
    listener: ListenerId,
    replay_requested: Rc<Cell<bool>>,
    last_replay_at: Option<Millis>,
    engine: SyncEngine<R, S>,
    /// Rows holding data, mirrored with the remote Row Range Record.
    rows: RowRangeTracker,
    /// Rows loaded from the remote during this session.
    fetched: RowRangeTracker,
    cache: RowCache,
    collector: EditCollector,
    batcher: EditBatcher,
    fetches: FetchQueue<RowRange>,
    presence: PresenceSync,
    subscriptions: BTreeMap<DocPath, SubscriptionId>,
}

impl<R: RemoteStore, S: OpLogStore + BlockStore> GridSync<R, S> {
    pub fn new(
        config: SyncConfig,
        client_id: ClientId,
        remote: R,
        store: S,
        network: NetworkMonitor,
        clock: Rc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let paths = config.paths();
        let client_key = client_id.to_string();

        let replay_requested = Rc::new(Cell::new(false));
        let flag = Rc::clone(&replay_requested);
        let listener = network.subscribe(move |online| {
            if online {
                flag.set(true);
            }
        });

        Ok(Self {
            engine: SyncEngine::new(remote, store, network.clone(), paths.clone()),
            collector: EditCollector::new(config.debounce_ms),
            batcher: EditBatcher::new(client_key.clone(), paths.clone(), config.max_batch_writes),
            fetches: FetchQueue::new(config.fetch.clone()),
            presence: PresenceSync::new(client_key, config.presence.clone()),
            rows: RowRangeTracker::new(),
            fetched: RowRangeTracker::new(),
            cache: RowCache::new(),
            subscriptions: BTreeMap::new(),
            last_replay_at: None,
            replay_requested,
            listener,
            network,
            clock,
            paths,
            config,
        })
    }

    /// Connect and replay anything left in the Operation Log. Offline, this
    /// does nothing; replay then starts on the next transition to online.
    pub fn start(&mut self) -> Result<Option<ReplayReport>, EngineError> {
        if !self.network.is_online() {
            info!(sheet = %self.config.sheet, "starting offline");
            return Ok(None);
        }
        let now = self.clock.now_ms();
        self.run_replay(now).map(Some)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn engine(&self) -> &SyncEngine<R, S> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SyncEngine<R, S> {
        &mut self.engine
    }

    pub fn row(&self, row: u64) -> Option<&RowEntry> {
        self.cache.get(row)
    }

    pub fn cell(&self, row: u64, column: &str) -> Option<&CellState> {
        self.cache.get(row).and_then(|e| e.cell(column))
    }

    pub fn value(&self, row: u64, column: &str) -> Option<&Value> {
        self.cache.get(row).and_then(|e| e.value(column))
    }

    /// Rows known to hold data.
    pub fn known_rows(&self) -> Vec<RowRange> {
        self.rows.known_ranges()
    }

    pub fn collaborators(&self) -> &BTreeMap<String, PresenceEntry> {
        self.presence.collaborators()
    }

    pub fn pending_ops(&self) -> Result<Vec<PendingOperation>, EngineError> {
        Ok(self.engine.store().all_ops()?)
    }

    pub fn buffered_edits(&self) -> usize {
        self.collector.len()
    }

    /// Queue a fetch for the rows of `viewport` not yet loaded. Returns
    /// `None` when every row is already resident.
    pub fn request_viewport(&mut self, viewport: RowRange) -> Option<TaskId> {
        let need = self.fetched.check_which_rows_need_fetch(viewport)?;
        let now = self.clock.now_ms();
        let id = self.fetches.add(FetchRequest::new(need, viewport), now);
        debug!(%viewport, %need, task = %id, "viewport fetch queued");
        Some(id)
    }

    pub fn cancel_fetch(&mut self, id: TaskId) -> bool {
        self.fetches.cancel(id)
    }

    /// Apply edits locally and buffer them for the next flush.
    pub fn edit(&mut self, edits: Vec<CellEdit>) -> Result<(), EngineError> {
        if edits.is_empty() {
            return Ok(());
        }
        let now = self.clock.now_ms();
        let mut rect: Option<EditRect> = None;
        for edit in &edits {
            self.cache.get_for_edit(edit.row, now).apply_edit(
                &edit.column,
                edit.value.clone(),
                edit.style.clone(),
                now,
            );
            let cell = EditRect::cell(edit.row, column_ordinal(&edit.column));
            rect = Some(rect.map_or(cell, |r| r.union(&cell)));
        }
        self.collector.edit(edits, now);

        if let Some(rect) = rect {
            let op = self.presence.record_edit(rect, now)?;
            self.write_presence(vec![op])?;
        }
        Ok(())
    }

    /// Flush buffered edits without waiting for the debounce timer.
    pub fn flush_now(&mut self) -> Result<Option<PushReport>, EngineError> {
        let edits = self.collector.drain();
        if edits.is_empty() {
            return Ok(None);
        }
        let now = self.clock.now_ms();
        self.flush_edits(edits, now).map(Some)
    }

    /// Run all timer-driven work that is due.
    pub fn tick(&mut self) -> Result<TickReport, EngineError> {
        let now = self.clock.now_ms();
        let mut report = TickReport::default();

        // Older logged ops go out before anything flushed in this tick.
        if self.network.is_online() {
            let requested = self.replay_requested.replace(false);
            let retry_due = self
                .last_replay_at
                .is_none_or(|at| now.saturating_sub(at) >= self.config.replay_retry_interval_ms);
            if requested || (retry_due && self.engine.pending_count()? > 0) {
                report.replay = Some(self.run_replay(now)?);
            }
        }

        if let Some(edits) = self.collector.poll(now) {
            report.flushed = Some(self.flush_edits(edits, now)?);
        }

        report.loaded_blocks = self.run_fetches(now)?;
        report.remote_changes = self.apply_remote_changes()?;
        self.presence_tick(now)?;
        self.cache.collect_garbage(now, self.config.outdated_max_age_ms);
        Ok(report)
    }

    /// Replay the Operation Log now, regardless of the retry timer.
    pub fn replay_now(&mut self) -> Result<ReplayReport, EngineError> {
        let now = self.clock.now_ms();
        self.run_replay(now)
    }

    /// Settle a conflicted cell.
    pub fn resolve_conflict(
        &mut self,
        row: u64,
        column: &str,
        choice: ConflictChoice,
    ) -> Result<(), EngineError> {
        let no_conflict = || EngineError::NoConflict {
            row,
            column: column.to_string(),
        };
        let cell = self
            .cell(row, column)
            .filter(|c| c.conflicted)
            .cloned()
            .ok_or_else(no_conflict)?;
        let block_id = self
            .rows
            .get_blocks_info_by_row_index(row)
            .map(|info| info.block_id.clone())
            .ok_or_else(no_conflict)?;
        let path = self.paths.block(&block_id);
        self.engine.drop_conflicted_column(&path, column)?;

        let now = self.clock.now_ms();
        match choice {
            ConflictChoice::KeepMine => {
                let entry = self.cache.get_for_edit(row, now);
                entry.apply_edit(column, cell.value.clone(), cell.style.clone(), now);
                if let Some(state) = entry.cells.get_mut(column) {
                    state.conflicted = false;
                }
                self.collector.edit(
                    [CellEdit {
                        row,
                        column: column.to_string(),
                        value: cell.value,
                        style: cell.style,
                    }],
                    now,
                );
            }
            ConflictChoice::TakeTheirs => {
                let remote = if self.network.is_online() {
                    self.engine.fetch_block(&path)?
                } else {
                    self.engine.store().get_block(&block_id)?.map(|c| c.block)
                };
                if let Some(entry) = self.cache.get_mut(row) {
                    entry.revert_cell(column, remote.as_ref());
                }
            }
        }
        info!(row, column, ?choice, "conflict resolved");
        Ok(())
    }

    /// Drop a pending operation without sending it.
    pub fn discard(&mut self, seq: OpSeq) -> Result<PendingOperation, EngineError> {
        self.engine.discard(seq, &mut self.cache)
    }

    /// Move rows to new indexes. Each moved Block gets its row field
    /// rewritten remotely; every `(from, to)` pair refers to the layout
    /// before the move.
    pub fn reorder_rows(&mut self, moves: &[(u64, u64)]) -> Result<Option<PushReport>, EngineError> {
        let now = self.clock.now_ms();
        let mut writes = Vec::new();
        for &(from, to) in moves {
            if let Some(info) = self.rows.get_blocks_info_by_row_index(from) {
                writes.push(RemoteWrite::Patch {
                    path: self.paths.block(&info.block_id),
                    ops: vec![
                        FieldOp::set(FieldPath::key(ROW_KEY), to),
                        FieldOp::set(FieldPath::key(UPDATED_KEY), now),
                    ],
                });
            }
        }
        self.cache.reorder_rows(moves);
        self.rows.relocate_blocks(moves);
        self.fetched.relocate_blocks(moves);
        if writes.is_empty() {
            return Ok(None);
        }

        let transaction_id = TransactionId::new();
        let mut ops = Vec::with_capacity(writes.len());
        for chunk in writes.chunks(self.config.max_batch_writes) {
            let batch_id = BatchId::new();
            ops.extend(chunk.iter().map(|write| NewPendingOp {
                write: write.clone(),
                created_at: now,
                correlation: None,
                batch_id: Some(batch_id),
                transaction_id: Some(transaction_id),
            }));
        }
        let persisted = self.engine.persist(&ops)?;
        let report = self.engine.push(persisted, &mut self.cache, &mut self.rows)?;
        info!(moved = ops.len(), "rows reordered");
        Ok(Some(report))
    }

    /// Fill the cache for `range` from the local Block copy. Unsaved cells
    /// already in the cache win over the stored values.
    pub fn restore_from_local(&mut self, range: RowRange) -> Result<usize, EngineError> {
        let blocks = self.engine.store().blocks_in_rows(range)?;
        for cached in &blocks {
            self.install_block(&cached.block_id, &cached.block, cached.cached_at);
        }
        debug!(%range, blocks = blocks.len(), "restored rows from local copy");
        Ok(blocks.len())
    }

    fn flush_edits(&mut self, edits: Vec<CellEdit>, now: Millis) -> Result<PushReport, EngineError> {
        let plan = self.batcher.plan(edits, now, &mut self.rows, &mut self.cache)?;
        let persisted = self.engine.persist(&plan.ops)?;
        let report = self.engine.push(persisted, &mut self.cache, &mut self.rows)?;
        for (_, block_id) in &plan.new_blocks {
            let path = self.paths.block(block_id);
            self.subscribe(path);
        }
        info!(
            ops = plan.ops.len(),
            confirmed = report.confirmed.len(),
            deferred = report.deferred.len(),
            failed = report.failed.len(),
            "flushed edits"
        );
        Ok(report)
    }

    fn run_replay(&mut self, now: Millis) -> Result<ReplayReport, EngineError> {
        self.last_replay_at = Some(now);
        match self.connect() {
            Err(err) if err.is_transient() => {
                warn!(error = %err, "remote unreachable; replay postponed");
                return Ok(ReplayReport {
                    interrupted: true,
                    ..ReplayReport::default()
                });
            }
            other => other?,
        }
        self.engine.replay(&mut self.cache, &mut self.rows)
    }

    /// Subscribe to the sheet metadata and pull the current Row Range Record
    /// and presence document.
    fn connect(&mut self) -> Result<(), EngineError> {
        let rows_path = self.paths.rows.clone();
        let presence_path = self.paths.presence.clone();
        self.subscribe(rows_path.clone());
        self.subscribe(presence_path.clone());

        if let Some(doc) = self.engine.remote_mut().get(&rows_path)? {
            match self.rows.merge_upstream(&doc) {
                Ok(added) => debug!(added, "row range record loaded"),
                Err(err) => warn!(error = %err, "ignoring unreadable row range record"),
            }
        }
        if let Some(doc) = self.engine.remote_mut().get(&presence_path)? {
            self.presence.receive(&doc, false);
        }
        Ok(())
    }

    fn subscribe(&mut self, path: DocPath) {
        if self.subscriptions.contains_key(&path) {
            return;
        }
        match self.engine.remote_mut().subscribe(&path) {
            Ok(id) => {
                self.subscriptions.insert(path, id);
            }
            Err(err) => debug!(error = %err, %path, "subscription deferred"),
        }
    }

    fn run_fetches(&mut self, now: Millis) -> Result<usize, EngineError> {
        let fetched = &self.fetched;
        let started = self.fetches.poll(now, |range| {
            let gaps = fetched.unknown_ranges(range);
            match (gaps.first(), gaps.last()) {
                (Some(first), Some(last)) => Some(RowRange::spanning(first.lo, last.hi)),
                _ => None,
            }
        });

        let mut loaded = 0;
        for task in started {
            let result = self.load_rows(task.range, now);
            self.fetches.finish(task.id);
            match result {
                Ok(count) => loaded += count,
                Err(err) if err.is_transient() => {
                    warn!(error = %err, range = %task.range, "fetch failed; serving local copy");
                    loaded += self.restore_from_local(task.range)?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(loaded)
    }

    /// Load the Blocks of `range` from the remote, or from the local copy
    /// while offline.
    fn load_rows(&mut self, range: RowRange, now: Millis) -> Result<usize, EngineError> {
        if !self.network.is_online() {
            return self.restore_from_local(range);
        }
        let query = Query {
            collection: self.paths.blocks.clone(),
            predicate: Predicate::Between {
                field: ROW_KEY.to_string(),
                lo: range.lo,
                hi: range.hi,
            },
            order_by: Some(ROW_KEY.to_string()),
            limit: None,
        };
        let docs = self.engine.remote_mut().query(&query)?;

        let mut cached = Vec::with_capacity(docs.len());
        for (path, doc) in docs {
            let block = match Block::from_value(&doc) {
                Ok(block) => block,
                Err(err) => {
                    warn!(error = %err, %path, "skipping unreadable block");
                    continue;
                }
            };
            let block_id = BlockId::new(path.id());
            self.install_block(&block_id, &block, now);
            self.subscribe(path);
            cached.push(CachedBlock {
                block_id,
                block,
                cached_at: now,
            });
        }
        self.engine.store_mut().put_blocks(&cached)?;
        self.fetched.mark_rows(range);
        debug!(%range, blocks = cached.len(), "rows loaded");
        Ok(cached.len())
    }

    fn install_block(&mut self, block_id: &BlockId, block: &Block, now: Millis) {
        self.cache.add(block.row, block_id, block, now);
        self.rows.set_block_id(block.row, block_id.clone(), block.updated_at);
        self.rows.mark_row(block.row);
    }

    fn apply_remote_changes(&mut self) -> Result<usize, EngineError> {
        let now = self.clock.now_ms();
        let changes = self.engine.remote_mut().poll_changes();
        for change in &changes {
            if change.path == self.paths.rows {
                if let (Some(doc), false) = (&change.value, change.is_local_echo) {
                    if let Err(err) = self.rows.merge_upstream(doc) {
                        warn!(error = %err, "ignoring unreadable row range record");
                    }
                }
            } else if change.path == self.paths.presence {
                if let Some(doc) = &change.value {
                    self.presence.receive(doc, change.is_local_echo);
                }
            } else if self.paths.is_block(&change.path) {
                let Some(doc) = &change.value else {
                    debug!(path = %change.path, "block removed remotely");
                    continue;
                };
                let block = match Block::from_value(doc) {
                    Ok(block) => block,
                    Err(err) => {
                        warn!(error = %err, path = %change.path, "ignoring unreadable block change");
                        continue;
                    }
                };
                let block_id = BlockId::new(change.path.id());
                // Echoes only refresh the local copy; the cache already
                // shows these values.
                if !change.is_local_echo && self.cache.get(block.row).is_some() {
                    self.install_block(&block_id, &block, now);
                }
                self.engine.store_mut().put_blocks(&[CachedBlock {
                    block_id,
                    block,
                    cached_at: now,
                }])?;
            }
        }
        Ok(changes.len())
    }

    fn presence_tick(&mut self, now: Millis) -> Result<(), EngineError> {
        if !self.network.is_online() {
            return Ok(());
        }
        let mut ops = Vec::new();
        if let Some(op) = self.presence.ping(now)? {
            ops.push(op);
        }
        ops.extend(self.presence.prune_stale(now));
        self.write_presence(ops)
    }

    /// Presence is best-effort and bypasses the Operation Log.
    fn write_presence(&mut self, ops: Vec<FieldOp>) -> Result<(), EngineError> {
        if ops.is_empty() || !self.network.is_online() {
            return Ok(());
        }
        let path = self.paths.presence.clone();
        let remote = self.engine.remote_mut();
        let result = match remote.patch(&path, &ops) {
            Err(RemoteError::NotFound(_)) => {
                let mut doc = Value::Null;
                apply_field_ops(&mut doc, &ops)?;
                remote.create(&path, &doc)
            }
            other => other,
        };
        if let Err(err) = result {
            debug!(error = %err, "presence update dropped");
        }
        Ok(())
    }
}

impl<R: RemoteStore, S: OpLogStore + BlockStore> Drop for GridSync<R, S> {
    fn drop(&mut self) {
        self.network.unsubscribe(self.listener);
        let ids: Vec<SubscriptionId> = self.subscriptions.values().copied().collect();
        for id in ids {
            self.engine.remote_mut().unsubscribe(id);
        }
    }
}
