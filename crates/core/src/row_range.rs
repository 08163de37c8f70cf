use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::CoreError;
use crate::ids::BlockId;
use crate::interval_set::{IntervalSet, RowRange};
use crate::time::Millis;

/// Format tag of the Row Range Record wire form.
pub const ROW_RANGE_FORMAT: &str = "1";

const FORMAT_KEY: &str = "format";

/// Encode ranges as `{ "format": "1", "<lo>~<hi>": true, ... }`.
pub fn encode_row_ranges<M: Clone>(set: &IntervalSet<M>) -> Value {
    let mut map = Map::new();
    map.insert(FORMAT_KEY.into(), Value::String(ROW_RANGE_FORMAT.into()));
    for (range, _) in set.iter() {
        map.insert(range.to_string(), Value::Bool(true));
    }
    Value::Object(map)
}

/// Decode a Row Range Record. Any unknown format tag or malformed entry
/// rejects the whole record.
pub fn decode_row_ranges(value: &Value) -> Result<IntervalSet, CoreError> {
    let map = value
        .as_object()
        .ok_or_else(|| CoreError::InvalidData("row range record is not an object".into()))?;

    match map.get(FORMAT_KEY) {
        Some(Value::String(tag)) if tag == ROW_RANGE_FORMAT => {}
        other => {
            return Err(CoreError::FormatMismatch {
                expected: ROW_RANGE_FORMAT,
                found: other.map(|v| v.to_string()),
            });
        }
    }

    let mut set = IntervalSet::new();
    for (key, flag) in map {
        if key == FORMAT_KEY {
            continue;
        }
        let present = flag
            .as_bool()
            .ok_or_else(|| CoreError::InvalidData(format!("non-boolean flag for {key}")))?;
        let range = parse_range_key(key)?;
        if present {
            set.add(range, None);
        }
    }
    Ok(set)
}

fn parse_range_key(key: &str) -> Result<RowRange, CoreError> {
    let (lo, hi) = key
        .split_once('~')
        .ok_or_else(|| CoreError::InvalidData(format!("bad range key {key:?}")))?;
    let lo: u64 = lo
        .parse()
        .map_err(|_| CoreError::InvalidData(format!("bad range key {key:?}")))?;
    let hi: u64 = hi
        .parse()
        .map_err(|_| CoreError::InvalidData(format!("bad range key {key:?}")))?;
    RowRange::new(lo, hi)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub block_id: BlockId,
    pub updated_at: Millis,
}

/// Tracks which rows are known and which Block stores each row.
#[derive(Debug, Clone, Default)]
pub struct RowRangeTracker {
    rows: IntervalSet,
    blocks: BTreeMap<u64, BlockInfo>,
}

impl RowRangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `row` was not known before.
    pub fn mark_row(&mut self, row: u64) -> bool {
        self.mark_rows(RowRange::single(row))
    }

    /// Returns true when any row of `range` was not known before.
    pub fn mark_rows(&mut self, range: RowRange) -> bool {
        if self.rows.has(range) {
            return false;
        }
        self.rows.add(range, None);
        true
    }

    pub fn unmark_rows(&mut self, range: RowRange) {
        self.rows.remove(range);
    }

    pub fn is_known(&self, row: u64) -> bool {
        self.rows.contains(row)
    }

    pub fn known_ranges(&self) -> Vec<RowRange> {
        self.rows.get_all()
    }

    pub fn unknown_ranges(&self, viewport: RowRange) -> Vec<RowRange> {
        self.rows.diff(viewport)
    }

    pub fn known_in(&self, viewport: RowRange) -> Vec<RowRange> {
        self.rows.intersect(viewport)
    }

    /// `None` when the viewport is fully known, the single gap when there is
    /// exactly one, otherwise the whole viewport. One larger request is
    /// preferred over several small ones.
    pub fn check_which_rows_need_fetch(&self, viewport: RowRange) -> Option<RowRange> {
        let gaps = self.rows.diff(viewport);
        match gaps.as_slice() {
            [] => None,
            [only] => Some(*only),
            _ => Some(viewport),
        }
    }

    pub fn encode_for_save(&self) -> Value {
        encode_row_ranges(&self.rows)
    }

    /// Replace known rows with the upstream record. A record in an unknown
    /// format leaves the tracker empty and returns false.
    pub fn load_from_upstream(&mut self, value: &Value) -> bool {
        match decode_row_ranges(value) {
            Ok(rows) => {
                self.rows = rows;
                true
            }
            Err(err) => {
                warn!(error = %err, "rejecting upstream row range record");
                self.rows.clear();
                false
            }
        }
    }

    /// Union the upstream record into the known rows. Returns how many
    /// upstream ranges were new.
    pub fn merge_upstream(&mut self, value: &Value) -> Result<usize, CoreError> {
        let upstream = decode_row_ranges(value)?;
        let mut added = 0;
        for range in upstream.get_all() {
            if self.mark_rows(range) {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn get_blocks_info_by_row_index(&self, row: u64) -> Option<&BlockInfo> {
        self.blocks.get(&row)
    }

    pub fn set_block_id(&mut self, row: u64, block_id: BlockId, updated_at: Millis) {
        self.blocks.insert(
            row,
            BlockInfo {
                block_id,
                updated_at,
            },
        );
    }

    pub fn touch_block(&mut self, row: u64, updated_at: Millis) {
        if let Some(info) = self.blocks.get_mut(&row) {
            info.updated_at = info.updated_at.max(updated_at);
        }
    }

    /// Move Block bookkeeping along with a row reorder. Each `(from, to)`
    /// pair is applied against the state before any move.
    pub fn relocate_blocks(&mut self, moves: &[(u64, u64)]) {
        let taken: Vec<(u64, Option<BlockInfo>)> = moves
            .iter()
            .map(|&(from, to)| (to, self.blocks.remove(&from)))
            .collect();
        for (to, info) in taken {
            if let Some(info) = info {
                self.blocks.insert(to, info);
                self.rows.add(RowRange::single(to), None);
            }
        }
    }
}
