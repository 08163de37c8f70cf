use serde::{Deserialize, Serialize};

use gridsync_core::{ids::DocPath, time::Millis};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DequeueOrder {
    Fifo,
    /// Newest request first: the latest viewport is what the user is looking at.
    Lifo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchQueueConfig {
    /// Minimum time between two dequeue rounds.
    pub tick_interval_ms: Millis,
    /// Maximum number of fetches in flight.
    pub parallel: usize,
    /// Queued ranges this close to the newest queued task are merged into it.
    pub merge_gap: u64,
    /// Merging never produces a range longer than this.
    pub max_merged_rows: u64,
    pub order: DequeueOrder,
    /// Tasks not started within this window are dropped. `None` disables expiry.
    pub task_timeout_ms: Option<Millis>,
}

impl Default for FetchQueueConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
            parallel: 2,
            merge_gap: 20,
            max_merged_rows: 500,
            order: DequeueOrder::Lifo,
            task_timeout_ms: Some(30_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub ping_interval_ms: Millis,
    pub stale_after_ms: Millis,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 60_000,
            stale_after_ms: gridsync_core::presence::PRESENCE_STALE_AFTER_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root path of the synced sheet in the remote store.
    pub sheet: String,
    /// Quiet period after the last edit before buffered edits are flushed.
    pub debounce_ms: Millis,
    pub fetch: FetchQueueConfig,
    pub presence: PresenceConfig,
    /// Interval of the periodic replay retry while online.
    pub replay_retry_interval_ms: Millis,
    /// Writes per atomic batch.
    pub max_batch_writes: usize,
    /// Rows in the outdated cache partition are dropped after this long.
    pub outdated_max_age_ms: Millis,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sheet: "sheet".to_string(),
            debounce_ms: 300,
            fetch: FetchQueueConfig::default(),
            presence: PresenceConfig::default(),
            replay_retry_interval_ms: 10_000,
            max_batch_writes: 500,
            outdated_max_age_ms: 5 * 60 * 1000,
        }
    }
}

impl SyncConfig {
    pub fn for_sheet(sheet: impl Into<String>) -> Self {
        Self {
            sheet: sheet.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON config. Missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.sheet.is_empty() || self.sheet.contains('/') {
            return Err(EngineError::Config(format!(
                "sheet must be a single path segment, got {:?}",
                self.sheet
            )));
        }
        if self.fetch.parallel == 0 {
            return Err(EngineError::Config("fetch.parallel must be at least 1".into()));
        }
        if self.max_batch_writes == 0 {
            return Err(EngineError::Config("max_batch_writes must be at least 1".into()));
        }
        Ok(())
    }

    pub fn paths(&self) -> SheetPaths {
        SheetPaths::new(&self.sheet)
    }
}

/// Remote document locations of one sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetPaths {
    pub blocks: DocPath,
    pub rows: DocPath,
    pub presence: DocPath,
}

impl SheetPaths {
    pub fn new(sheet: &str) -> Self {
        let root = DocPath::new(sheet);
        let meta = root.child("meta");
        Self {
            blocks: root.child("blocks"),
            rows: meta.child("rows"),
            presence: meta.child("presence"),
        }
    }

    pub fn block(&self, id: &gridsync_core::ids::BlockId) -> DocPath {
        self.blocks.child(id.as_str())
    }

    pub fn is_block(&self, path: &DocPath) -> bool {
        path.parent().as_ref() == Some(&self.blocks)
    }
}
