//! In-memory remote document store shared by every test client.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use serde_json::Value;

use gridsync_core::{
    field_ops::{FieldOp, apply_field_ops},
    ids::DocPath,
    operations::RemoteWrite,
};
use gridsync_engine::{DocChange, Query, RemoteError, RemoteStore, SubscriptionId};

struct Subscription {
    id: SubscriptionId,
    client: u64,
    path: DocPath,
}

#[derive(Default)]
struct HubState {
    docs: BTreeMap<DocPath, Value>,
    subscriptions: Vec<Subscription>,
    inboxes: BTreeMap<u64, Vec<DocChange>>,
    unreachable: BTreeSet<u64>,
    rejected_paths: BTreeSet<DocPath>,
    next_client: u64,
    next_subscription: u64,
    writes: usize,
}

impl HubState {
    fn check(&self, client: u64) -> Result<(), RemoteError> {
        if self.unreachable.contains(&client) {
            Err(RemoteError::Unavailable(format!("client {client} cannot reach the store")))
        } else {
            Ok(())
        }
    }

    /// Compute the new documents for `writes` without touching the store.
    fn stage(&self, writes: &[RemoteWrite]) -> Result<BTreeMap<DocPath, Option<Value>>, RemoteError> {
        let mut staged: BTreeMap<DocPath, Option<Value>> = BTreeMap::new();
        for write in writes {
            let path = write.path();
            if self.rejected_paths.contains(path) {
                return Err(RemoteError::Rejected(format!("writes to {path} are not allowed")));
            }
            let current = match staged.get(path) {
                Some(doc) => doc.clone(),
                None => self.docs.get(path).cloned(),
            };
            if matches!(write, RemoteWrite::Patch { .. }) && current.is_none() {
                return Err(RemoteError::NotFound(path.clone()));
            }
            let next = write
                .apply_to(current)
                .map_err(|e| RemoteError::Rejected(e.to_string()))?;
            staged.insert(path.clone(), next);
        }
        Ok(staged)
    }

    fn commit(&mut self, writer: Option<u64>, staged: BTreeMap<DocPath, Option<Value>>) {
        for (path, doc) in staged {
            match &doc {
                Some(value) => {
                    self.docs.insert(path.clone(), value.clone());
                }
                None => {
                    self.docs.remove(&path);
                }
            }
            self.writes += 1;
            for sub in self.subscriptions.iter().filter(|s| s.path == path) {
                self.inboxes.entry(sub.client).or_default().push(DocChange {
                    subscription: sub.id,
                    path: path.clone(),
                    value: doc.clone(),
                    is_local_echo: writer == Some(sub.client),
                });
            }
        }
    }
}

/// The shared store. Clones refer to the same documents.
#[derive(Clone, Default)]
pub struct RemoteHub {
    state: Rc<RefCell<HubState>>,
}

impl RemoteHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection for a new client.
    pub fn connect(&self) -> MemoryRemote {
        let mut state = self.state.borrow_mut();
        let client = state.next_client;
        state.next_client += 1;
        MemoryRemote {
            hub: self.clone(),
            client,
        }
    }

    pub fn doc(&self, path: &DocPath) -> Option<Value> {
        self.state.borrow().docs.get(path).cloned()
    }

    /// Documents directly under `collection`.
    pub fn docs_in(&self, collection: &DocPath) -> Vec<(DocPath, Value)> {
        self.state
            .borrow()
            .docs
            .iter()
            .filter(|(path, _)| path.parent().as_ref() == Some(collection))
            .map(|(p, v)| (p.clone(), v.clone()))
            .collect()
    }

    /// Write a document as an outside party, notifying every subscriber.
    pub fn put(&self, path: &DocPath, doc: Value) {
        let mut staged = BTreeMap::new();
        staged.insert(path.clone(), Some(doc));
        self.state.borrow_mut().commit(None, staged);
    }

    /// Patch a document as an outside party.
    pub fn patch(&self, path: &DocPath, ops: &[FieldOp]) -> Result<(), RemoteError> {
        let mut state = self.state.borrow_mut();
        let mut doc = state
            .docs
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(path.clone()))?;
        apply_field_ops(&mut doc, ops).map_err(|e| RemoteError::Rejected(e.to_string()))?;
        let mut staged = BTreeMap::new();
        staged.insert(path.clone(), Some(doc));
        state.commit(None, staged);
        Ok(())
    }

    /// Delete a document as an outside party.
    pub fn delete(&self, path: &DocPath) {
        let mut staged = BTreeMap::new();
        staged.insert(path.clone(), None);
        self.state.borrow_mut().commit(None, staged);
    }

    pub fn reject_writes_to(&self, path: &DocPath, reject: bool) {
        let mut state = self.state.borrow_mut();
        if reject {
            state.rejected_paths.insert(path.clone());
        } else {
            state.rejected_paths.remove(path);
        }
    }

    /// Number of document writes committed so far.
    pub fn write_count(&self) -> usize {
        self.state.borrow().writes
    }
}

/// One client's connection to a [`RemoteHub`].
#[derive(Clone)]
pub struct MemoryRemote {
    hub: RemoteHub,
    client: u64,
}

impl MemoryRemote {
    pub fn client(&self) -> u64 {
        self.client
    }

    pub fn hub(&self) -> &RemoteHub {
        &self.hub
    }

    /// Cut or restore this client's connection. Changes delivered while cut
    /// off are held until it is restored.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.hub.state.borrow_mut();
        if reachable {
            state.unreachable.remove(&self.client);
        } else {
            state.unreachable.insert(self.client);
        }
    }

    fn write(&mut self, writes: &[RemoteWrite]) -> Result<(), RemoteError> {
        let mut state = self.hub.state.borrow_mut();
        state.check(self.client)?;
        let staged = state.stage(writes)?;
        state.commit(Some(self.client), staged);
        Ok(())
    }
}

impl RemoteStore for MemoryRemote {
    fn get(&mut self, path: &DocPath) -> Result<Option<Value>, RemoteError> {
        let state = self.hub.state.borrow();
        state.check(self.client)?;
        Ok(state.docs.get(path).cloned())
    }

    fn query(&mut self, query: &Query) -> Result<Vec<(DocPath, Value)>, RemoteError> {
        let state = self.hub.state.borrow();
        state.check(self.client)?;
        let mut found: Vec<(DocPath, Value)> = state
            .docs
            .iter()
            .filter(|(path, doc)| {
                path.parent().as_ref() == Some(&query.collection) && query.predicate.matches(doc)
            })
            .map(|(p, v)| (p.clone(), v.clone()))
            .collect();
        if let Some(field) = &query.order_by {
            found.sort_by_key(|(_, doc)| doc.get(field).and_then(Value::as_u64));
        }
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    fn create(&mut self, path: &DocPath, doc: &Value) -> Result<(), RemoteError> {
        self.write(&[RemoteWrite::Create {
            path: path.clone(),
            doc: doc.clone(),
        }])
    }

    fn patch(&mut self, path: &DocPath, ops: &[FieldOp]) -> Result<(), RemoteError> {
        self.write(&[RemoteWrite::Patch {
            path: path.clone(),
            ops: ops.to_vec(),
        }])
    }

    fn batch_write(&mut self, writes: &[RemoteWrite]) -> Result<(), RemoteError> {
        self.write(writes)
    }

    fn subscribe(&mut self, path: &DocPath) -> Result<SubscriptionId, RemoteError> {
        let mut state = self.hub.state.borrow_mut();
        state.check(self.client)?;
        let id = SubscriptionId(state.next_subscription);
        state.next_subscription += 1;
        state.subscriptions.push(Subscription {
            id,
            client: self.client,
            path: path.clone(),
        });
        Ok(id)
    }

    fn unsubscribe(&mut self, id: SubscriptionId) {
        self.hub
            .state
            .borrow_mut()
            .subscriptions
            .retain(|s| s.id != id);
    }

    fn poll_changes(&mut self) -> Vec<DocChange> {
        let mut state = self.hub.state.borrow_mut();
        if state.unreachable.contains(&self.client) {
            return Vec::new();
        }
        state.inboxes.remove(&self.client).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(p: &str) -> DocPath {
        DocPath::new(p)
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let hub = RemoteHub::new();
        let mut remote = hub.connect();
        let err = remote.batch_write(&[
            RemoteWrite::Create {
                path: path("s/blocks/a"),
                doc: json!({"x": 1}),
            },
            RemoteWrite::Patch {
                path: path("s/blocks/missing"),
                ops: vec![],
            },
        ]);
        assert!(matches!(err, Err(RemoteError::NotFound(_))));
        assert!(hub.doc(&path("s/blocks/a")).is_none());
        assert_eq!(hub.write_count(), 0);
    }

    #[test]
    fn subscribers_see_echo_flag() {
        let hub = RemoteHub::new();
        let mut a = hub.connect();
        let mut b = hub.connect();
        a.subscribe(&path("s/meta/rows")).unwrap();
        b.subscribe(&path("s/meta/rows")).unwrap();
        a.create(&path("s/meta/rows"), &json!({"format": "1"})).unwrap();

        let mine = a.poll_changes();
        let theirs = b.poll_changes();
        assert_eq!(mine.len(), 1);
        assert!(mine[0].is_local_echo);
        assert!(!theirs[0].is_local_echo);
        assert!(a.poll_changes().is_empty());
    }

    #[test]
    fn unreachable_client_fails_and_holds_changes() {
        let hub = RemoteHub::new();
        let mut a = hub.connect();
        a.subscribe(&path("doc/x")).unwrap();
        a.set_reachable(false);
        assert!(matches!(a.get(&path("doc/x")), Err(RemoteError::Unavailable(_))));
        hub.put(&path("doc/x"), json!(1));
        assert!(a.poll_changes().is_empty());
        a.set_reachable(true);
        assert_eq!(a.poll_changes().len(), 1);
    }

    #[test]
    fn query_filters_orders_and_limits() {
        let hub = RemoteHub::new();
        for (id, row) in [("a", 5), ("b", 1), ("c", 9), ("d", 3)] {
            hub.put(&path(&format!("s/blocks/{id}")), json!({"r": row}));
        }
        hub.put(&path("s/meta/rows"), json!({"r": 2}));
        let mut remote = hub.connect();
        let found = remote
            .query(&Query {
                collection: path("s/blocks"),
                predicate: gridsync_engine::Predicate::Between {
                    field: "r".into(),
                    lo: 1,
                    hi: 5,
                },
                order_by: Some("r".into()),
                limit: Some(2),
            })
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|(p, _)| p.id()).collect();
        assert_eq!(ids, vec!["b", "d"]);
    }
}
