use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::block::{Block, CellWrite, DATA_KEY, TYPES_KEY, UPDATED_KEY, column_of};
use crate::error::CoreError;
use crate::field_ops::{FieldOp, FieldPath, apply_field_ops};
use crate::ids::*;
use crate::interval_set::RowRange;
use crate::time::Millis;

/// A single remote mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteWrite {
    Create { path: DocPath, doc: Value },
    Patch { path: DocPath, ops: Vec<FieldOp> },
    Delete { path: DocPath },
}

impl RemoteWrite {
    pub fn path(&self) -> &DocPath {
        match self {
            Self::Create { path, .. } | Self::Patch { path, .. } | Self::Delete { path } => path,
        }
    }

    /// String name of the write kind for storage/indexing.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Patch { .. } => "patch",
            Self::Delete { .. } => "delete",
        }
    }

    /// Apply this write to the current document, returning the new one
    /// (`None` once deleted).
    pub fn apply_to(&self, current: Option<Value>) -> Result<Option<Value>, CoreError> {
        match self {
            Self::Create { doc, .. } => Ok(Some(doc.clone())),
            Self::Patch { ops, .. } => {
                let mut doc = current.unwrap_or(Value::Null);
                apply_field_ops(&mut doc, ops)?;
                Ok(Some(doc))
            }
            Self::Delete { .. } => Ok(None),
        }
    }

    /// Narrow a Block write to the given columns. Block-level fields stay.
    pub fn retain_columns(&self, columns: &BTreeSet<String>) -> Result<RemoteWrite, CoreError> {
        match self {
            Self::Create { path, doc } => {
                let mut block = Block::from_value(doc)?;
                block.retain_columns(columns);
                Ok(Self::Create {
                    path: path.clone(),
                    doc: block.to_value()?,
                })
            }
            Self::Patch { path, ops } => Ok(Self::Patch {
                path: path.clone(),
                ops: ops
                    .iter()
                    .filter(|op| column_of(op.path()).is_none_or(|c| columns.contains(c)))
                    .cloned()
                    .collect(),
            }),
            Self::Delete { .. } => Ok(self.clone()),
        }
    }

    /// Turn a `Create` of a Block into the equivalent field patch, so it can
    /// be merged into a Block that already exists remotely.
    pub fn into_block_patch(self) -> Result<RemoteWrite, CoreError> {
        match self {
            Self::Create { path, doc } => {
                let block = Block::from_value(&doc)?;
                let mut ops = Vec::new();
                for column in block.columns() {
                    let cells = [CellWrite {
                        column: column.to_string(),
                        value: block.data.get(column).cloned(),
                        style: block.styles.get(column).cloned(),
                    }];
                    let version = block.field_version(column).unwrap_or(block.updated_at);
                    let mut cell_ops = Block::patch_for(&cells, version);
                    // patch_for appends the Block stamp; it is re-added once below.
                    cell_ops.pop();
                    ops.extend(cell_ops);
                }
                for (column, type_override) in &block.types {
                    ops.push(FieldOp::set(
                        FieldPath::nested(TYPES_KEY, column.as_str()),
                        type_override.clone(),
                    ));
                }
                ops.push(FieldOp::set(
                    FieldPath::key(UPDATED_KEY),
                    block.updated_at,
                ));
                Ok(Self::Patch { path, ops })
            }
            other => Ok(other),
        }
    }

    /// True when no per-column data remains in a Block write.
    pub fn has_column_data(&self) -> bool {
        match self {
            Self::Create { doc, .. } => Block::from_value(doc)
                .map(|block| !block.columns().is_empty())
                .unwrap_or(true),
            Self::Patch { ops, .. } => ops.iter().any(|op| column_of(op.path()).is_some()),
            Self::Delete { .. } => true,
        }
    }
}

/// What a Pending Operation refers to in the grid, used to choose its
/// replay strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Correlation {
    /// Per-column edit commit against one row's Block.
    CellEdit { row: u64, columns: BTreeSet<String> },
    /// Update of the Row Range Record adding these ranges.
    RowRanges { ranges: Vec<RowRange> },
}

impl Correlation {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::CellEdit { .. } => "cell_edit",
            Self::RowRanges { .. } => "row_ranges",
        }
    }

    pub fn row(&self) -> Option<u64> {
        match self {
            Self::CellEdit { row, .. } => Some(*row),
            Self::RowRanges { .. } => None,
        }
    }
}

/// A Pending Operation before the Operation Log has assigned its key.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPendingOp {
    pub write: RemoteWrite,
    pub created_at: Millis,
    pub correlation: Option<Correlation>,
    pub batch_id: Option<BatchId>,
    pub transaction_id: Option<TransactionId>,
}

/// Durable record of a not-yet-confirmed remote write.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub seq: OpSeq,
    pub write: RemoteWrite,
    pub created_at: Millis,
    pub correlation: Option<Correlation>,
    pub batch_id: Option<BatchId>,
    pub transaction_id: Option<TransactionId>,
    /// Columns excluded from a replay because the remote holds a newer value.
    pub conflicted: BTreeSet<String>,
}

impl PendingOperation {
    pub fn target(&self) -> &DocPath {
        self.write.path()
    }

    pub fn row(&self) -> Option<u64> {
        self.correlation.as_ref().and_then(Correlation::row)
    }

    pub fn columns(&self) -> BTreeSet<String> {
        match &self.correlation {
            Some(Correlation::CellEdit { columns, .. }) => columns.clone(),
            _ => BTreeSet::new(),
        }
    }

    /// Every column of this op is conflicted; replay skips it until the
    /// conflict is resolved.
    pub fn awaits_resolution(&self) -> bool {
        let columns = self.columns();
        !columns.is_empty() && columns.iter().all(|c| self.conflicted.contains(c))
    }

    /// Value this operation writes to `column`: `Some(None)` for a clear,
    /// `None` when the column is not touched.
    pub fn cell_value(&self, column: &str) -> Option<Option<Value>> {
        match &self.write {
            RemoteWrite::Create { doc, .. } => {
                let block = Block::from_value(doc).ok()?;
                block
                    .versions
                    .contains_key(column)
                    .then(|| block.data.get(column).cloned())
            }
            RemoteWrite::Patch { ops, .. } => {
                let mut found = None;
                for op in ops {
                    let path = op.path();
                    if path.first() != DATA_KEY || path.get(1) != Some(column) {
                        continue;
                    }
                    found = Some(match op {
                        FieldOp::Set { value, .. } => Some(value.clone()),
                        _ => None,
                    });
                }
                found
            }
            RemoteWrite::Delete { .. } => None,
        }
    }
}
