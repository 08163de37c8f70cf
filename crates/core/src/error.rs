use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("format mismatch: expected {expected:?}, found {found:?}")]
    FormatMismatch {
        expected: &'static str,
        found: Option<String>,
    },

    #[error("invalid range: {lo}~{hi}")]
    InvalidRange { lo: u64, hi: u64 },

    #[error("invalid field path: {0}")]
    InvalidFieldPath(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
