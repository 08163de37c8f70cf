use gridsync_core::time::ManualClock;
use gridsync_engine::{EngineError, SyncConfig};

use crate::TestClient;
use crate::remote::RemoteHub;

/// Several clients sharing one remote store and one clock.
pub struct TestNetwork {
    pub hub: RemoteHub,
    pub clock: ManualClock,
    config: SyncConfig,
    clients: Vec<TestClient>,
}

impl TestNetwork {
    pub fn new(config: SyncConfig, start: u64) -> Self {
        Self {
            hub: RemoteHub::new(),
            clock: ManualClock::new(start),
            config,
            clients: Vec::new(),
        }
    }

    pub fn add_client(&mut self) -> Result<usize, EngineError> {
        let mut client = TestClient::new(&self.hub, &self.clock, self.config.clone())?;
        client.sync.start()?;
        let index = self.clients.len();
        self.clients.push(client);
        Ok(index)
    }

    pub fn client(&self, index: usize) -> &TestClient {
        &self.clients[index]
    }

    pub fn client_mut(&mut self, index: usize) -> &mut TestClient {
        &mut self.clients[index]
    }

    /// Advance the clock by `ms` and tick every client once.
    pub fn advance(&mut self, ms: u64) -> Result<(), EngineError> {
        self.clock.advance(ms);
        for client in &mut self.clients {
            client.sync.tick()?;
        }
        Ok(())
    }
}
