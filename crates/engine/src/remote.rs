//! The remote document store, seen from the client.

use serde_json::Value;
use thiserror::Error;

use gridsync_core::{
    field_ops::FieldOp,
    ids::DocPath,
    operations::RemoteWrite,
};

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network failure or timeout. The write may be retried later.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// The addressed document does not exist.
    #[error("document not found: {0}")]
    NotFound(DocPath),

    /// The store refused the write.
    #[error("write rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All,
    Eq { field: String, value: Value },
    /// Numeric field within `[lo, hi]`.
    Between { field: String, lo: u64, hi: u64 },
}

impl Predicate {
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Self::All => true,
            Self::Eq { field, value } => doc.get(field) == Some(value),
            Self::Between { field, lo, hi } => doc
                .get(field)
                .and_then(Value::as_u64)
                .is_some_and(|n| *lo <= n && n <= *hi),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: DocPath,
    pub predicate: Predicate,
    /// Ascending numeric order on this field.
    pub order_by: Option<String>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn all(collection: DocPath) -> Self {
        Self {
            collection,
            predicate: Predicate::All,
            order_by: None,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// A change delivered on a document subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct DocChange {
    pub subscription: SubscriptionId,
    pub path: DocPath,
    /// `None` when the document was deleted.
    pub value: Option<Value>,
    /// The change originated from this client's own write.
    pub is_local_echo: bool,
}

pub trait RemoteStore {
    fn get(&mut self, path: &DocPath) -> Result<Option<Value>, RemoteError>;

    fn query(&mut self, query: &Query) -> Result<Vec<(DocPath, Value)>, RemoteError>;

    /// Write a whole document, replacing any existing one.
    fn create(&mut self, path: &DocPath, doc: &Value) -> Result<(), RemoteError>;

    /// Apply field operations to an existing document.
    fn patch(&mut self, path: &DocPath, ops: &[FieldOp]) -> Result<(), RemoteError>;

    /// Apply all writes atomically: either every write lands or none does.
    fn batch_write(&mut self, writes: &[RemoteWrite]) -> Result<(), RemoteError>;

    fn subscribe(&mut self, path: &DocPath) -> Result<SubscriptionId, RemoteError>;

    fn unsubscribe(&mut self, id: SubscriptionId);

    /// Drain changes delivered since the last call.
    fn poll_changes(&mut self) -> Vec<DocChange>;
}

/// Send one write through the matching single-document call.
pub fn write_one<R: RemoteStore + ?Sized>(
    remote: &mut R,
    write: &RemoteWrite,
) -> Result<(), RemoteError> {
    match write {
        RemoteWrite::Create { path, doc } => remote.create(path, doc),
        RemoteWrite::Patch { path, ops } => remote.patch(path, ops),
        RemoteWrite::Delete { .. } => remote.batch_write(std::slice::from_ref(write)),
    }
}
