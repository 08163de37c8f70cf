//! Debounced buffering of cell edits and their conversion into Pending
//! Operations at flush time.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::debug;

use gridsync_core::{
    block::{Block, BlockIdAllocator, CellWrite},
    error::CoreError,
    ids::{BatchId, BlockId, TransactionId},
    interval_set::{IntervalSet, RowRange},
    operations::{Correlation, NewPendingOp, RemoteWrite},
    row_range::RowRangeTracker,
    time::Millis,
};

use crate::config::SheetPaths;
use crate::row_cache::RowCache;

/// A single cell change requested by the grid.
#[derive(Debug, Clone, PartialEq)]
pub struct CellEdit {
    pub row: u64,
    pub column: String,
    /// `None` clears the cell.
    pub value: Option<Value>,
    pub style: Option<Value>,
}

impl CellEdit {
    pub fn set(row: u64, column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            row,
            column: column.into(),
            value: Some(value.into()),
            style: None,
        }
    }

    pub fn clear(row: u64, column: impl Into<String>) -> Self {
        Self {
            row,
            column: column.into(),
            value: None,
            style: None,
        }
    }

    pub fn with_style(mut self, style: Value) -> Self {
        self.style = Some(style);
        self
    }

    fn key(&self) -> String {
        format!("{}-{}", self.row, self.column)
    }
}

/// Buffers edits until no new edit has arrived for the debounce delay.
///
/// A later edit to the same cell replaces the earlier one: the earlier
/// entry's queue position is dropped and the latest edit joins the back of
/// the queue, so flushed edits follow the order of their last change.
#[derive(Debug)]
pub struct EditCollector {
    debounce_ms: Millis,
    queue: BTreeMap<u64, CellEdit>,
    index: BTreeMap<String, u64>,
    next_slot: u64,
    deadline: Option<Millis>,
}

impl EditCollector {
    pub fn new(debounce_ms: Millis) -> Self {
        Self {
            debounce_ms,
            queue: BTreeMap::new(),
            index: BTreeMap::new(),
            next_slot: 0,
            deadline: None,
        }
    }

    pub fn edit(&mut self, edits: impl IntoIterator<Item = CellEdit>, now: Millis) {
        for edit in edits {
            let slot = self.next_slot;
            self.next_slot += 1;
            if let Some(earlier) = self.index.insert(edit.key(), slot) {
                self.queue.remove(&earlier);
            }
            self.queue.insert(slot, edit);
        }
        self.deadline = Some(now.saturating_add(self.debounce_ms));
    }

    pub fn is_due(&self, now: Millis) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    pub fn deadline(&self) -> Option<Millis> {
        self.deadline
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Take the buffered edits once the debounce delay has elapsed.
    pub fn poll(&mut self, now: Millis) -> Option<Vec<CellEdit>> {
        if !self.is_due(now) {
            return None;
        }
        Some(self.drain())
    }

    /// Take the buffered edits regardless of the debounce timer.
    pub fn drain(&mut self) -> Vec<CellEdit> {
        self.deadline = None;
        self.index.clear();
        std::mem::take(&mut self.queue).into_values().collect()
    }
}

/// Operations produced by one flush.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushPlan {
    pub transaction_id: TransactionId,
    pub ops: Vec<NewPendingOp>,
    /// Rows that had no Block and were assigned one.
    pub new_blocks: Vec<(u64, BlockId)>,
}

/// Turns flushed edits into Block writes grouped per row.
#[derive(Debug)]
pub struct EditBatcher {
    allocator: BlockIdAllocator,
    paths: SheetPaths,
    max_batch_writes: usize,
}

impl EditBatcher {
    pub fn new(client_tag: impl Into<String>, paths: SheetPaths, max_batch_writes: usize) -> Self {
        Self {
            allocator: BlockIdAllocator::new(client_tag),
            paths,
            max_batch_writes: max_batch_writes.max(1),
        }
    }

    /// Build the Pending Operations for `edits`.
    ///
    /// Rows with a Block get a patch of the changed fields. Rows without one
    /// get a fresh Block id and a full create carrying every cell the cache
    /// holds for the row. Newly known rows also produce a Row Range Record
    /// update. All ops share one transaction id; batch ids are assigned per
    /// chunk of `max_batch_writes`.
    pub fn plan(
        &mut self,
        edits: Vec<CellEdit>,
        now: Millis,
        rows: &mut RowRangeTracker,
        cache: &mut RowCache,
    ) -> Result<FlushPlan, CoreError> {
        let transaction_id = TransactionId::new();
        let mut by_row: BTreeMap<u64, Vec<CellWrite>> = BTreeMap::new();
        for edit in edits {
            by_row.entry(edit.row).or_default().push(CellWrite {
                column: edit.column,
                value: edit.value,
                style: edit.style,
            });
        }

        let mut writes = Vec::with_capacity(by_row.len() + 1);
        let mut new_blocks = Vec::new();
        let mut new_rows: IntervalSet = IntervalSet::new();

        for (row, cells) in by_row {
            let columns: BTreeSet<String> = cells.iter().map(|c| c.column.clone()).collect();
            let existing = rows
                .get_blocks_info_by_row_index(row)
                .map(|info| info.block_id.clone());
            let write = match existing {
                Some(block_id) => {
                    let path = self.paths.block(&block_id);
                    rows.touch_block(row, now);
                    RemoteWrite::Patch {
                        path,
                        ops: Block::patch_for(&cells, now),
                    }
                }
                None => {
                    let block_id = self.allocator.allocate(now);
                    let entry = cache.get_for_edit(row, now);
                    let full: Vec<CellWrite> = entry
                        .cells
                        .iter()
                        .map(|(column, cell)| CellWrite {
                            column: column.clone(),
                            value: cell.value.clone(),
                            style: cell.style.clone(),
                        })
                        .collect();
                    let mut block = Block::create_for(row, &full, now);
                    block.types = entry
                        .cells
                        .iter()
                        .filter_map(|(c, cell)| cell.type_override.clone().map(|t| (c.clone(), t)))
                        .collect();
                    entry.block_id = Some(block_id.clone());
                    rows.set_block_id(row, block_id.clone(), now);
                    new_blocks.push((row, block_id.clone()));
                    RemoteWrite::Create {
                        path: self.paths.block(&block_id),
                        doc: block.to_value()?,
                    }
                }
            };
            let columns = match &write {
                RemoteWrite::Create { .. } => cache
                    .get(row)
                    .map(|e| e.cells.keys().cloned().collect())
                    .unwrap_or(columns),
                _ => columns,
            };
            if rows.mark_row(row) {
                new_rows.add(RowRange::single(row), None);
            }
            writes.push((write, Some(Correlation::CellEdit { row, columns })));
        }

        if !new_rows.is_empty() {
            writes.push((
                RemoteWrite::Create {
                    path: self.paths.rows.clone(),
                    doc: rows.encode_for_save(),
                },
                Some(Correlation::RowRanges {
                    ranges: new_rows.get_all(),
                }),
            ));
        }

        let mut ops = Vec::with_capacity(writes.len());
        for chunk in writes.chunks(self.max_batch_writes) {
            let batch_id = BatchId::new();
            for (write, correlation) in chunk {
                ops.push(NewPendingOp {
                    write: write.clone(),
                    created_at: now,
                    correlation: correlation.clone(),
                    batch_id: Some(batch_id),
                    transaction_id: Some(transaction_id),
                });
            }
        }
        debug!(ops = ops.len(), new_blocks = new_blocks.len(), %transaction_id, "planned flush");

        Ok(FlushPlan {
            transaction_id,
            ops,
            new_blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridsync_core::row_range::decode_row_ranges;
    use serde_json::json;

    fn paths() -> SheetPaths {
        SheetPaths::new("s")
    }

    #[test]
    fn later_edit_replaces_earlier_and_moves_to_back() {
        let mut collector = EditCollector::new(300);
        collector.edit([CellEdit::set(1, "A", "foo"), CellEdit::set(2, "A", "x")], 0);
        collector.edit([CellEdit::set(1, "A", "bar")], 100);
        assert_eq!(collector.len(), 2);

        assert!(collector.poll(399).is_none());
        let flushed = collector.poll(400).unwrap();
        assert_eq!(flushed, vec![CellEdit::set(2, "A", "x"), CellEdit::set(1, "A", "bar")]);
        assert!(collector.is_empty());
        assert!(collector.poll(10_000).is_none());
    }

    #[test]
    fn coalesced_edit_produces_one_patch() {
        let mut collector = EditCollector::new(300);
        collector.edit([CellEdit::set(4, "A", "foo")], 0);
        collector.edit([CellEdit::set(4, "A", "bar")], 10);

        let mut rows = RowRangeTracker::new();
        rows.set_block_id(4, BlockId::new("b4"), 0);
        rows.mark_row(4);
        let mut cache = RowCache::new();
        let mut batcher = EditBatcher::new("c", paths(), 500);
        let plan = batcher.plan(collector.drain(), 1_000, &mut rows, &mut cache).unwrap();

        assert_eq!(plan.ops.len(), 1);
        let op = &plan.ops[0];
        assert_eq!(op.write.path().as_str(), "s/blocks/b4");
        let RemoteWrite::Patch { ops, .. } = &op.write else {
            panic!("expected patch");
        };
        assert_eq!(ops[0], gridsync_core::FieldOp::set(gridsync_core::FieldPath::nested("d", "A"), "bar"));
        assert_eq!(
            op.correlation,
            Some(Correlation::CellEdit { row: 4, columns: ["A".to_string()].into() })
        );
    }

    #[test]
    fn new_row_gets_block_and_range_record_update() {
        let mut rows = RowRangeTracker::new();
        let mut cache = RowCache::new();
        cache.get_for_edit(7, 0).apply_edit("A", Some(json!(1)), None, 0);
        cache.get_for_edit(7, 0).apply_edit("B", Some(json!(2)), None, 0);
        let mut batcher = EditBatcher::new("c", paths(), 500);
        let plan = batcher.plan(vec![CellEdit::set(7, "B", 2)], 2_000, &mut rows, &mut cache).unwrap();

        assert_eq!(plan.ops.len(), 2);
        assert_eq!(plan.new_blocks.len(), 1);
        let (row, block_id) = &plan.new_blocks[0];
        assert_eq!(*row, 7);
        assert_eq!(cache.get(7).unwrap().block_id.as_ref(), Some(block_id));
        assert_eq!(rows.get_blocks_info_by_row_index(7).unwrap().block_id, *block_id);

        let RemoteWrite::Create { doc, .. } = &plan.ops[0].write else {
            panic!("expected create");
        };
        let block = Block::from_value(doc).unwrap();
        assert_eq!(block.row, 7);
        assert_eq!(block.data["A"], json!(1));
        assert_eq!(block.data["B"], json!(2));

        let RemoteWrite::Create { path, doc } = &plan.ops[1].write else {
            panic!("expected row range record");
        };
        assert_eq!(path.as_str(), "s/meta/rows");
        assert!(decode_row_ranges(doc).unwrap().contains(7));
        assert!(plan.ops.iter().all(|op| op.transaction_id == Some(plan.transaction_id)));
        assert_eq!(plan.ops[0].batch_id, plan.ops[1].batch_id);
    }

    #[test]
    fn large_flush_is_chunked_into_batches() {
        let mut rows = RowRangeTracker::new();
        for row in 0..5 {
            rows.set_block_id(row, BlockId::new(format!("b{row}")), 0);
            rows.mark_row(row);
        }
        let mut cache = RowCache::new();
        let mut batcher = EditBatcher::new("c", paths(), 2);
        let edits = (0..5).map(|row| CellEdit::set(row, "A", row)).collect();
        let plan = batcher.plan(edits, 10, &mut rows, &mut cache).unwrap();

        assert_eq!(plan.ops.len(), 5);
        let batches: BTreeSet<_> = plan.ops.iter().map(|op| op.batch_id).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(plan.ops[0].batch_id, plan.ops[1].batch_id);
        assert_ne!(plan.ops[1].batch_id, plan.ops[2].batch_id);
    }
}
