pub mod client;
pub mod network;
pub mod remote;

pub use client::{TestClient, TestSync};
pub use network::TestNetwork;
pub use remote::{MemoryRemote, RemoteHub};
