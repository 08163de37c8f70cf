use gridsync_core::{CoreError, OpSeq};
use gridsync_storage::StorageError;
use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("pending operation not found: {0}")]
    OperationNotFound(OpSeq),

    #[error("no conflict at row {row}, column {column}")]
    NoConflict { row: u64, column: String },
}

impl EngineError {
    /// True for failures that should leave work queued for the next replay.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Remote(e) if e.is_transient())
    }
}
