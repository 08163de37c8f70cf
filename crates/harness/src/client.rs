use std::path::Path;
use std::rc::Rc;

use serde_json::Value;

use gridsync_core::{ids::ClientId, interval_set::RowRange, time::ManualClock};
use gridsync_engine::{
    CellEdit, EngineError, GridSync, NetworkMonitor, ReplayReport, SyncConfig, TickReport,
};
use gridsync_storage::SqliteStorage;

use crate::remote::{MemoryRemote, RemoteHub};

pub type TestSync = GridSync<MemoryRemote, SqliteStorage>;

pub struct TestClient {
    pub client_id: ClientId,
    pub clock: ManualClock,
    pub network: NetworkMonitor,
    pub remote: MemoryRemote,
    pub sync: TestSync,
}

impl TestClient {
    /// A client with an in-memory Operation Log.
    pub fn new(hub: &RemoteHub, clock: &ManualClock, config: SyncConfig) -> Result<Self, EngineError> {
        let store = SqliteStorage::open_in_memory()?;
        Self::with_store(hub, clock, config, ClientId::new(), store)
    }

    /// A client whose Operation Log lives in the database at `path`.
    pub fn open(
        hub: &RemoteHub,
        clock: &ManualClock,
        config: SyncConfig,
        client_id: ClientId,
        path: impl AsRef<Path>,
    ) -> Result<Self, EngineError> {
        let store = SqliteStorage::open(path)?;
        Self::with_store(hub, clock, config, client_id, store)
    }

    pub fn with_store(
        hub: &RemoteHub,
        clock: &ManualClock,
        config: SyncConfig,
        client_id: ClientId,
        store: SqliteStorage,
    ) -> Result<Self, EngineError> {
        let remote = hub.connect();
        let network = NetworkMonitor::new(true);
        let sync = GridSync::new(
            config,
            client_id,
            remote.clone(),
            store,
            network.clone(),
            Rc::new(clock.clone()),
        )?;
        Ok(Self {
            client_id,
            clock: clock.clone(),
            network,
            remote,
            sync,
        })
    }

    /// Drop the connection: the store becomes unreachable and the network
    /// monitor reports offline.
    pub fn go_offline(&self) {
        self.remote.set_reachable(false);
        self.network.set_connected(false);
    }

    pub fn go_online(&self) {
        self.remote.set_reachable(true);
        self.network.set_connected(true);
    }

    pub fn set(&mut self, row: u64, column: &str, value: impl Into<Value>) -> Result<(), EngineError> {
        self.sync.edit(vec![CellEdit::set(row, column, value)])
    }

    pub fn value(&self, row: u64, column: &str) -> Option<Value> {
        self.sync.value(row, column).cloned()
    }

    pub fn tick(&mut self) -> Result<TickReport, EngineError> {
        self.sync.tick()
    }

    /// Advance the shared clock past the debounce delay and tick.
    pub fn settle(&mut self) -> Result<TickReport, EngineError> {
        self.clock.advance(self.sync.config().debounce_ms);
        self.sync.tick()
    }

    /// Request `rows` and tick until the fetch has run.
    pub fn load(&mut self, lo: u64, hi: u64) -> Result<usize, EngineError> {
        let range = RowRange::new(lo, hi)?;
        if self.sync.request_viewport(range).is_none() {
            return Ok(0);
        }
        self.clock.advance(self.sync.config().fetch.tick_interval_ms);
        Ok(self.sync.tick()?.loaded_blocks)
    }

    pub fn replay(&mut self) -> Result<ReplayReport, EngineError> {
        self.sync.replay_now()
    }

    pub fn pending(&self) -> Result<usize, EngineError> {
        Ok(self.sync.pending_ops()?.len())
    }
}
