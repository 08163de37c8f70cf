use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::field_ops::{FieldOp, FieldPath};
use crate::ids::BlockId;
use crate::time::Millis;

/// Format tag of the Block wire form.
pub const BLOCK_FORMAT: &str = "2";

pub const ROW_KEY: &str = "r";
pub const UPDATED_KEY: &str = "u";
pub const DATA_KEY: &str = "d";
pub const VERSIONS_KEY: &str = "v";
pub const TYPES_KEY: &str = "t";
pub const STYLES_KEY: &str = "s";

const PER_COLUMN_KEYS: [&str; 4] = [DATA_KEY, VERSIONS_KEY, TYPES_KEY, STYLES_KEY];

/// Remote storage unit holding the raw fields of one grid row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub row: u64,
    pub updated_at: Millis,
    pub data: BTreeMap<String, Value>,
    pub versions: BTreeMap<String, Millis>,
    pub types: BTreeMap<String, Value>,
    pub styles: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize)]
struct BlockWire {
    format: String,
    r: u64,
    u: Millis,
    #[serde(default)]
    d: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    v: BTreeMap<String, Millis>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    t: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    s: BTreeMap<String, Value>,
}

/// One cell's contribution to a Block write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellWrite {
    pub column: String,
    /// `None` clears the cell.
    pub value: Option<Value>,
    pub style: Option<Value>,
}

impl Block {
    pub fn new(row: u64) -> Self {
        Self {
            row,
            ..Self::default()
        }
    }

    /// Fresh Block for `row` carrying `cells`, every field versioned at `now`.
    pub fn create_for(row: u64, cells: &[CellWrite], now: Millis) -> Self {
        let mut block = Self::new(row);
        block.updated_at = now;
        for cell in cells {
            block.apply_cell(cell, now);
        }
        block
    }

    fn apply_cell(&mut self, cell: &CellWrite, now: Millis) {
        match &cell.value {
            Some(value) => {
                self.data.insert(cell.column.clone(), value.clone());
            }
            None => {
                self.data.remove(&cell.column);
            }
        }
        if let Some(style) = &cell.style {
            self.styles.insert(cell.column.clone(), style.clone());
        }
        self.versions.insert(cell.column.clone(), now);
    }

    /// Field operations writing only the changed `cells`, the Block-level
    /// updated-at stamp and a per-field version of `now`.
    pub fn patch_for(cells: &[CellWrite], now: Millis) -> Vec<FieldOp> {
        let mut ops = Vec::with_capacity(cells.len() * 2 + 1);
        for cell in cells {
            let data_path = FieldPath::nested(DATA_KEY, cell.column.as_str());
            ops.push(match &cell.value {
                Some(value) => FieldOp::set(data_path, value.clone()),
                None => FieldOp::delete(data_path),
            });
            if let Some(style) = &cell.style {
                ops.push(FieldOp::set(
                    FieldPath::nested(STYLES_KEY, cell.column.as_str()),
                    style.clone(),
                ));
            }
            ops.push(FieldOp::set(
                FieldPath::nested(VERSIONS_KEY, cell.column.as_str()),
                now,
            ));
        }
        ops.push(FieldOp::set(FieldPath::key(UPDATED_KEY), now));
        ops
    }

    pub fn field_version(&self, column: &str) -> Option<Millis> {
        self.versions.get(column).copied()
    }

    pub fn columns(&self) -> BTreeSet<&str> {
        self.data
            .keys()
            .chain(self.versions.keys())
            .map(String::as_str)
            .collect()
    }

    /// Keep only the per-column entries of `columns`.
    pub fn retain_columns(&mut self, columns: &BTreeSet<String>) {
        self.data.retain(|k, _| columns.contains(k));
        self.versions.retain(|k, _| columns.contains(k));
        self.types.retain(|k, _| columns.contains(k));
        self.styles.retain(|k, _| columns.contains(k));
    }

    pub fn to_value(&self) -> Result<Value, CoreError> {
        let wire = BlockWire {
            format: BLOCK_FORMAT.to_string(),
            r: self.row,
            u: self.updated_at,
            d: self.data.clone(),
            v: self.versions.clone(),
            t: self.types.clone(),
            s: self.styles.clone(),
        };
        serde_json::to_value(wire).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Decode a Block document. Unknown format tags are rejected before any
    /// other field is looked at.
    pub fn from_value(value: &Value) -> Result<Self, CoreError> {
        match value.get("format") {
            Some(Value::String(tag)) if tag == BLOCK_FORMAT => {}
            other => {
                return Err(CoreError::FormatMismatch {
                    expected: BLOCK_FORMAT,
                    found: other.map(|v| v.to_string()),
                });
            }
        }
        let wire: BlockWire = serde_json::from_value(value.clone())
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        Ok(Self {
            row: wire.r,
            updated_at: wire.u,
            data: wire.d,
            versions: wire.v,
            types: wire.t,
            styles: wire.s,
        })
    }
}

/// Column addressed by a per-column field path (`d.<col>`, `v.<col>`, ...).
pub fn column_of(path: &FieldPath) -> Option<&str> {
    if path.len() >= 2 && PER_COLUMN_KEYS.contains(&path.first()) {
        path.get(1)
    } else {
        None
    }
}

/// Allocates time-based Block ids with a per-second monotonic suffix.
///
/// Ids embed the allocating client's tag so two clients creating Blocks in
/// the same second never collide.
#[derive(Debug, Clone)]
pub struct BlockIdAllocator {
    tag: String,
    second: u64,
    counter: u32,
}

impl BlockIdAllocator {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            second: 0,
            counter: 0,
        }
    }

    pub fn allocate(&mut self, now: Millis) -> BlockId {
        let second = now / 1000;
        if second > self.second {
            self.second = second;
            self.counter = 0;
        } else {
            // Same second, or the clock stepped backwards: stay on the
            // highest second seen and keep counting.
            self.counter += 1;
        }
        BlockId::new(format!("{:010x}{:04x}-{}", self.second, self.counter, self.tag))
    }
}
