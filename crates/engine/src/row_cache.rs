//! In-memory rows for the grid, split into a live partition and an outdated
//! shadow. Clearing the cache moves live rows to the shadow so that edits
//! made during the window before a reload are not lost.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::debug;

use gridsync_core::{block::Block, ids::BlockId, time::Millis};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellState {
    pub value: Option<Value>,
    pub style: Option<Value>,
    pub type_override: Option<Value>,
    /// Remote per-field version this cell was last loaded at.
    pub version: Option<Millis>,
    /// Time of the latest local edit not yet confirmed by the remote.
    pub unsaved_since: Option<Millis>,
    /// The remote holds a newer value than the pending local edit.
    pub conflicted: bool,
}

impl CellState {
    pub fn is_unsaved(&self) -> bool {
        self.unsaved_since.is_some()
    }

    fn is_empty(&self) -> bool {
        self.value.is_none() && self.style.is_none() && self.type_override.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowEntry {
    pub row: u64,
    pub block_id: Option<BlockId>,
    pub updated_at: Millis,
    pub loaded_at: Millis,
    pub cells: BTreeMap<String, CellState>,
}

impl RowEntry {
    pub fn new(row: u64, loaded_at: Millis) -> Self {
        Self {
            row,
            loaded_at,
            ..Self::default()
        }
    }

    pub fn cell(&self, column: &str) -> Option<&CellState> {
        self.cells.get(column)
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.cells.get(column).and_then(|c| c.value.as_ref())
    }

    pub fn has_unsaved(&self) -> bool {
        self.cells.values().any(CellState::is_unsaved)
    }

    pub fn unsaved_columns(&self) -> BTreeSet<String> {
        self.cells
            .iter()
            .filter(|(_, c)| c.is_unsaved())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn conflicted_columns(&self) -> BTreeSet<String> {
        self.cells
            .iter()
            .filter(|(_, c)| c.conflicted)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Apply a local edit and mark the cell unsaved as of `at`.
    pub fn apply_edit(&mut self, column: &str, value: Option<Value>, style: Option<Value>, at: Millis) {
        let cell = self.cells.entry(column.to_string()).or_default();
        cell.value = value;
        if style.is_some() {
            cell.style = style;
        }
        cell.unsaved_since = Some(at);
    }

    /// Merge a remote Block. Unsaved cells keep their local state; every
    /// other cell takes the remote one.
    pub fn merge_remote(&mut self, block_id: &BlockId, block: &Block, loaded_at: Millis) {
        self.block_id = Some(block_id.clone());
        self.updated_at = block.updated_at;
        self.loaded_at = loaded_at;

        let remote_columns: BTreeSet<&str> = block
            .columns()
            .into_iter()
            .chain(block.styles.keys().map(String::as_str))
            .chain(block.types.keys().map(String::as_str))
            .collect();
        self.cells
            .retain(|column, cell| cell.is_unsaved() || remote_columns.contains(column.as_str()));

        for column in remote_columns {
            let cell = self.cells.entry(column.to_string()).or_default();
            if cell.is_unsaved() {
                continue;
            }
            cell.value = block.data.get(column).cloned();
            cell.style = block.styles.get(column).cloned();
            cell.type_override = block.types.get(column).cloned();
            cell.version = block.field_version(column);
        }
    }

    /// Clear unsaved markers on `columns` whose latest edit is not newer
    /// than `confirmed_at`.
    pub fn mark_saved(&mut self, columns: &BTreeSet<String>, confirmed_at: Millis) {
        for column in columns {
            if let Some(cell) = self.cells.get_mut(column) {
                if cell.unsaved_since.is_some_and(|t| t <= confirmed_at) {
                    cell.unsaved_since = None;
                    cell.conflicted = false;
                }
            }
        }
    }

    pub fn mark_conflicted(&mut self, columns: &BTreeSet<String>) {
        for column in columns {
            if let Some(cell) = self.cells.get_mut(column) {
                cell.conflicted = true;
            }
        }
    }

    /// Drop the local state of `column`, restoring the last remote value if
    /// one is given.
    pub fn revert_cell(&mut self, column: &str, remote: Option<&Block>) {
        let Some(cell) = self.cells.get_mut(column) else {
            return;
        };
        cell.unsaved_since = None;
        cell.conflicted = false;
        if let Some(block) = remote {
            cell.value = block.data.get(column).cloned();
            cell.style = block.styles.get(column).cloned();
            cell.type_override = block.types.get(column).cloned();
            cell.version = block.field_version(column);
        }
        if cell.is_empty() {
            self.cells.remove(column);
        }
    }
}

#[derive(Debug, Default)]
pub struct RowCache {
    live: BTreeMap<u64, RowEntry>,
    outdated: BTreeMap<u64, RowEntry>,
}

impl RowCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a remote Block for `row`. An existing entry for the row, live
    /// or outdated, is merged so its unsaved cells survive.
    pub fn add(&mut self, row: u64, block_id: &BlockId, block: &Block, loaded_at: Millis) -> &RowEntry {
        let mut entry = self
            .live
            .remove(&row)
            .or_else(|| self.outdated.remove(&row))
            .unwrap_or_else(|| RowEntry::new(row, loaded_at));
        self.outdated.remove(&row);
        entry.merge_remote(block_id, block, loaded_at);
        self.live.entry(row).or_insert(entry)
    }

    /// Live or outdated entry for `row`.
    pub fn get(&self, row: u64) -> Option<&RowEntry> {
        self.live.get(&row).or_else(|| self.outdated.get(&row))
    }

    pub fn get_mut(&mut self, row: u64) -> Option<&mut RowEntry> {
        match self.live.get_mut(&row) {
            Some(entry) => Some(entry),
            None => self.outdated.get_mut(&row),
        }
    }

    pub fn is_live(&self, row: u64) -> bool {
        self.live.contains_key(&row)
    }

    /// Entry to apply an edit to. Outdated entries are promoted back to the
    /// live partition; unknown rows start empty.
    pub fn get_for_edit(&mut self, row: u64, now: Millis) -> &mut RowEntry {
        if !self.live.contains_key(&row) {
            let entry = self
                .outdated
                .remove(&row)
                .unwrap_or_else(|| RowEntry::new(row, now));
            self.live.insert(row, entry);
        }
        self.live.entry(row).or_insert_with(|| RowEntry::new(row, now))
    }

    /// Move every live row to the outdated partition.
    pub fn clear(&mut self) {
        let live = std::mem::take(&mut self.live);
        debug!(rows = live.len(), "row cache cleared to outdated partition");
        self.outdated.extend(live);
    }

    /// Move rows to new indexes. Each `(from, to)` pair is applied against
    /// the state before any move.
    pub fn reorder_rows(&mut self, moves: &[(u64, u64)]) {
        for partition in [&mut self.live, &mut self.outdated] {
            let taken: Vec<(u64, Option<RowEntry>)> = moves
                .iter()
                .map(|&(from, to)| (to, partition.remove(&from)))
                .collect();
            for (to, entry) in taken {
                if let Some(mut entry) = entry {
                    entry.row = to;
                    partition.insert(to, entry);
                }
            }
        }
    }

    /// Drop outdated rows older than `max_age` that hold no unsaved cells.
    pub fn collect_garbage(&mut self, now: Millis, max_age: Millis) -> usize {
        let before = self.outdated.len();
        self.outdated
            .retain(|_, e| e.has_unsaved() || now.saturating_sub(e.loaded_at) <= max_age);
        let dropped = before - self.outdated.len();
        if dropped > 0 {
            debug!(dropped, "collected outdated rows");
        }
        dropped
    }

    pub fn live_rows(&self) -> impl Iterator<Item = &RowEntry> {
        self.live.values()
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn outdated_len(&self) -> usize {
        self.outdated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridsync_core::block::CellWrite;
    use serde_json::json;

    fn block(row: u64, cells: &[(&str, Value)], at: Millis) -> Block {
        let cells: Vec<CellWrite> = cells
            .iter()
            .map(|(c, v)| CellWrite {
                column: c.to_string(),
                value: Some(v.clone()),
                style: None,
            })
            .collect();
        Block::create_for(row, &cells, at)
    }

    fn cols(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn remote_merge_preserves_unsaved_cells() {
        let mut cache = RowCache::new();
        let id = BlockId::new("b1");
        cache.add(3, &id, &block(3, &[("A", json!(1)), ("B", json!(2))], 10), 10);

        cache.get_for_edit(3, 20).apply_edit("A", Some(json!("mine")), None, 20);
        cache.add(3, &id, &block(3, &[("A", json!(9)), ("B", json!(8))], 30), 30);

        let entry = cache.get(3).unwrap();
        assert_eq!(entry.value("A"), Some(&json!("mine")));
        assert_eq!(entry.value("B"), Some(&json!(8)));
        assert_eq!(entry.unsaved_columns(), cols(&["A"]));
    }

    #[test]
    fn clear_keeps_edits_reachable() {
        let mut cache = RowCache::new();
        cache.add(1, &BlockId::new("b"), &block(1, &[("A", json!(1))], 10), 10);
        cache.get_for_edit(1, 15).apply_edit("A", Some(json!(2)), None, 15);
        cache.clear();
        assert!(!cache.is_live(1));
        assert_eq!(cache.outdated_len(), 1);
        assert_eq!(cache.get(1).unwrap().value("A"), Some(&json!(2)));

        // Reloading the row carries the unsaved edit forward.
        cache.add(1, &BlockId::new("b"), &block(1, &[("A", json!(5))], 40), 40);
        assert!(cache.is_live(1));
        assert_eq!(cache.outdated_len(), 0);
        assert_eq!(cache.get(1).unwrap().value("A"), Some(&json!(2)));
    }

    #[test]
    fn get_for_edit_promotes_outdated() {
        let mut cache = RowCache::new();
        cache.add(1, &BlockId::new("b"), &block(1, &[("A", json!(1))], 10), 10);
        cache.clear();
        cache.get_for_edit(1, 20).apply_edit("B", Some(json!(2)), None, 20);
        let entry = cache.get(1).unwrap();
        assert!(cache.is_live(1));
        assert_eq!(entry.value("A"), Some(&json!(1)));
        assert_eq!(entry.block_id, Some(BlockId::new("b")));
    }

    #[test]
    fn mark_saved_respects_later_edits() {
        let mut entry = RowEntry::new(0, 0);
        entry.apply_edit("A", Some(json!(1)), None, 100);
        entry.apply_edit("B", Some(json!(1)), None, 300);
        entry.mark_conflicted(&cols(&["A"]));
        entry.mark_saved(&cols(&["A", "B"]), 200);
        assert!(!entry.cell("A").unwrap().is_unsaved());
        assert!(!entry.cell("A").unwrap().conflicted);
        assert!(entry.cell("B").unwrap().is_unsaved());
    }

    #[test]
    fn reorder_moves_entries() {
        let mut cache = RowCache::new();
        cache.add(1, &BlockId::new("x"), &block(1, &[("A", json!("x"))], 10), 10);
        cache.add(2, &BlockId::new("y"), &block(2, &[("A", json!("y"))], 10), 10);
        cache.reorder_rows(&[(1, 2), (2, 1)]);
        assert_eq!(cache.get(1).unwrap().value("A"), Some(&json!("y")));
        assert_eq!(cache.get(2).unwrap().row, 2);
        assert_eq!(cache.get(2).unwrap().block_id, Some(BlockId::new("x")));
    }

    #[test]
    fn garbage_collection_spares_unsaved() {
        let mut cache = RowCache::new();
        cache.add(1, &BlockId::new("a"), &block(1, &[("A", json!(1))], 0), 0);
        cache.add(2, &BlockId::new("b"), &block(2, &[("A", json!(1))], 0), 0);
        cache.get_for_edit(2, 5).apply_edit("A", Some(json!(2)), None, 5);
        cache.clear();
        assert_eq!(cache.collect_garbage(1_000, 5_000), 0);
        assert_eq!(cache.collect_garbage(10_000, 5_000), 1);
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
    }

    #[test]
    fn revert_restores_remote_value() {
        let remote = block(0, &[("A", json!("theirs"))], 50);
        let mut entry = RowEntry::new(0, 0);
        entry.apply_edit("A", Some(json!("mine")), None, 10);
        entry.mark_conflicted(&cols(&["A"]));
        entry.revert_cell("A", Some(&remote));
        let cell = entry.cell("A").unwrap();
        assert_eq!(cell.value, Some(json!("theirs")));
        assert_eq!(cell.version, Some(50));
        assert!(!cell.is_unsaved() && !cell.conflicted);

        entry.apply_edit("B", Some(json!(1)), None, 10);
        entry.revert_cell("B", Some(&remote));
        assert!(entry.cell("B").is_none());
    }
}
