use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::time::Millis;

/// Presence entries older than this are eligible for removal by any client.
pub const PRESENCE_STALE_AFTER_MS: Millis = 60 * 60 * 1000;

/// Rectangle of cells touched by a collaborator's last edit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRect {
    pub row0: u64,
    pub col0: u64,
    pub row1: u64,
    pub col1: u64,
}

impl EditRect {
    pub fn cell(row: u64, col: u64) -> Self {
        Self {
            row0: row,
            col0: col,
            row1: row,
            col1: col,
        }
    }

    /// Smallest rectangle containing both.
    pub fn union(&self, other: &EditRect) -> EditRect {
        EditRect {
            row0: self.row0.min(other.row0),
            col0: self.col0.min(other.col0),
            row1: self.row1.max(other.row1),
            col1: self.col1.max(other.col1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub edit_index: u64,
    pub last_edit: EditRect,
    pub last_edit_at: Millis,
    pub last_ping_at: Millis,
}

impl PresenceEntry {
    pub fn is_stale(&self, now: Millis, stale_after: Millis) -> bool {
        now.saturating_sub(self.last_ping_at) > stale_after
    }
}

/// Decode a presence document. Entries that do not parse are skipped: one
/// client on a newer layout must not hide everyone else.
pub fn decode_presence(value: &Value) -> Result<BTreeMap<String, PresenceEntry>, CoreError> {
    let map = value
        .as_object()
        .ok_or_else(|| CoreError::InvalidData("presence document is not an object".into()))?;
    Ok(map
        .iter()
        .filter_map(|(client, entry)| {
            serde_json::from_value::<PresenceEntry>(entry.clone())
                .ok()
                .map(|entry| (client.clone(), entry))
        })
        .collect())
}

pub fn encode_presence_entry(entry: &PresenceEntry) -> Result<Value, CoreError> {
    serde_json::to_value(entry).map_err(|e| CoreError::Serialization(e.to_string()))
}
