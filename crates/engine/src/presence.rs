use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use gridsync_core::{
    error::CoreError,
    field_ops::{FieldOp, FieldPath},
    presence::{EditRect, PresenceEntry, decode_presence, encode_presence_entry},
    time::Millis,
};

use crate::config::PresenceConfig;

/// Zero-based ordinal of a spreadsheet-style column name (`A` is 0, `AA` is
/// 26). Numeric names are taken as-is; anything else maps to 0.
pub fn column_ordinal(column: &str) -> u64 {
    if let Ok(n) = column.parse::<u64>() {
        return n;
    }
    if column.is_empty() || !column.chars().all(|c| c.is_ascii_alphabetic()) {
        return 0;
    }
    let mut ordinal: u64 = 0;
    for c in column.chars() {
        let digit = u64::from(c.to_ascii_uppercase() as u8 - b'A') + 1;
        ordinal = ordinal.saturating_mul(26).saturating_add(digit);
    }
    ordinal - 1
}

/// This client's presence entry plus the last known entries of everyone else.
///
/// Methods return the field operations to send to the presence document;
/// the caller decides whether and how to send them.
#[derive(Debug)]
pub struct PresenceSync {
    client_key: String,
    config: PresenceConfig,
    local: Option<PresenceEntry>,
    collaborators: BTreeMap<String, PresenceEntry>,
}

impl PresenceSync {
    pub fn new(client_key: impl Into<String>, config: PresenceConfig) -> Self {
        Self {
            client_key: client_key.into(),
            config,
            local: None,
            collaborators: BTreeMap::new(),
        }
    }

    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    pub fn local(&self) -> Option<&PresenceEntry> {
        self.local.as_ref()
    }

    pub fn collaborators(&self) -> &BTreeMap<String, PresenceEntry> {
        &self.collaborators
    }

    /// Record an edit of `rect`, bumping the edit counter.
    pub fn record_edit(&mut self, rect: EditRect, now: Millis) -> Result<FieldOp, CoreError> {
        let entry = self.local.get_or_insert(PresenceEntry {
            edit_index: 0,
            last_edit: rect,
            last_edit_at: now,
            last_ping_at: now,
        });
        entry.edit_index += 1;
        entry.last_edit = rect;
        entry.last_edit_at = now;
        entry.last_ping_at = now;
        Ok(FieldOp::set(
            FieldPath::key(self.client_key.as_str()),
            encode_presence_entry(entry)?,
        ))
    }

    /// Keep-alive, at most once per ping interval.
    pub fn ping(&mut self, now: Millis) -> Result<Option<FieldOp>, CoreError> {
        match &mut self.local {
            Some(entry) => {
                if now.saturating_sub(entry.last_ping_at) < self.config.ping_interval_ms {
                    return Ok(None);
                }
                entry.last_ping_at = now;
                Ok(Some(FieldOp::set(
                    FieldPath::nested(self.client_key.as_str(), "lastPingAt"),
                    now,
                )))
            }
            None => {
                let entry = self.local.insert(PresenceEntry {
                    edit_index: 0,
                    last_edit: EditRect::default(),
                    last_edit_at: 0,
                    last_ping_at: now,
                });
                Ok(Some(FieldOp::set(
                    FieldPath::key(self.client_key.as_str()),
                    encode_presence_entry(entry)?,
                )))
            }
        }
    }

    /// Take in a presence document delivered by the remote. Echoes of this
    /// client's own writes are ignored.
    pub fn receive(&mut self, doc: &Value, is_local_echo: bool) {
        if is_local_echo {
            return;
        }
        match decode_presence(doc) {
            Ok(mut entries) => {
                entries.remove(&self.client_key);
                debug!(collaborators = entries.len(), "presence updated");
                self.collaborators = entries;
            }
            Err(err) => warn!(error = %err, "ignoring unreadable presence document"),
        }
    }

    /// Forget collaborators whose last ping is older than the staleness
    /// window and return the deletes that remove them remotely.
    pub fn prune_stale(&mut self, now: Millis) -> Vec<FieldOp> {
        let stale_after = self.config.stale_after_ms;
        let stale: Vec<String> = self
            .collaborators
            .iter()
            .filter(|(_, e)| e.is_stale(now, stale_after))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            self.collaborators.remove(key);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "pruning stale presence entries");
        }
        stale
            .into_iter()
            .map(|key| FieldOp::delete(FieldPath::key(key)))
            .collect()
    }
}
