//! Peer contract
//!
//! Every process that registers with the coordinator is a peer. Clients pull
//! work items and return results; servers perform an opaque service for the
//! clients assigned to them. The coordinator only ever talks to a peer through
//! these traits, so an in-process peer, a mock, and a TCP handle to a peer in
//! another process are interchangeable.
//!
//! # Modules
//!
//! - `lifecycle`: the running/dying/dead state machine behind `alive` and `die`
//! - `client`: client runner (registration, liveness listener, processing loop)
//! - `server`: server runner
//! - `exec`: processors and services backed by a shell command
//! - `mock`: scripted peers for tests

pub mod client;
pub mod exec;
pub mod lifecycle;
pub mod server;

#[cfg(test)]
pub mod mock;

use crate::error::CallResult;
use crate::work::{Payload, WorkItem};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub use client::{ClientOptions, ClientRunner, LocalClient, Processor, ServeProcessor};
pub use exec::{ExecProcessor, ExecService};
pub use lifecycle::{Lifecycle, PeerState, Renewal, RenewalWatch};
pub use server::{LocalServer, ServerOptions, ServerRunner, Service};

/// Declared by a server willing to take any number of clients
pub const ACCEPT_UNLIMITED_CLIENTS: i32 = 0;

/// Shared handle to a server peer
pub type ServerHandle = Arc<dyn ServerPeer>;

/// Calls every peer answers
#[async_trait]
pub trait Peer: Send + Sync {
    /// Id assigned by the coordinator at registration
    async fn id(&self) -> CallResult<u32>;

    async fn host(&self) -> CallResult<String>;

    /// Liveness ping
    ///
    /// Answers `true` while running normally and `false` exactly once as the
    /// peer begins a graceful shutdown. Callers stop pinging after `false`.
    async fn alive(&self) -> CallResult<bool>;

    /// Ask the peer to shut down, at once when `immediate` is set
    async fn die(&self, immediate: bool) -> CallResult<()>;

    /// Network address other processes can reach this peer at, if any
    fn endpoint(&self) -> Option<String> {
        None
    }
}

#[async_trait]
pub trait ClientPeer: Peer {
    /// The server this client was assigned to has died
    async fn server_down(&self, server_id: u32) -> CallResult<()>;
}

#[async_trait]
pub trait ServerPeer: Peer {
    /// Declared capacity, or [`ACCEPT_UNLIMITED_CLIENTS`]
    async fn max_clients(&self) -> CallResult<i32>;

    /// Whether clients may only be assigned by naming this server explicitly
    async fn accept_only_by_request(&self) -> CallResult<bool>;

    /// The server's opaque service
    async fn serve(&self, request: Payload) -> CallResult<Payload>;
}

/// Either kind of registered peer
#[derive(Clone)]
pub enum PeerHandle {
    Client(Arc<dyn ClientPeer>),
    Server(ServerHandle),
}

impl PeerHandle {
    pub async fn id(&self) -> CallResult<u32> {
        match self {
            Self::Client(c) => c.id().await,
            Self::Server(s) => s.id().await,
        }
    }

    pub async fn host(&self) -> CallResult<String> {
        match self {
            Self::Client(c) => c.host().await,
            Self::Server(s) => s.host().await,
        }
    }

    pub async fn alive(&self) -> CallResult<bool> {
        match self {
            Self::Client(c) => c.alive().await,
            Self::Server(s) => s.alive().await,
        }
    }

    pub async fn die(&self, immediate: bool) -> CallResult<()> {
        match self {
            Self::Client(c) => c.die(immediate).await,
            Self::Server(s) => s.die(immediate).await,
        }
    }
}

/// The coordinator's call surface as seen by peers
#[async_trait]
pub trait SwitchboardApi: Send + Sync {
    async fn register_client(&self, client: Arc<dyn ClientPeer>) -> CallResult<u32>;

    async fn register_server(&self, server: ServerHandle) -> CallResult<u32>;

    /// Assign the client to the least-loaded eligible server
    async fn get_server(&self, client_id: u32) -> CallResult<Option<ServerHandle>>;

    /// Assign the client to a specific server
    async fn get_server_by_id(
        &self,
        client_id: u32,
        server_id: u32,
    ) -> CallResult<Option<ServerHandle>>;

    /// Next item for the client to process; never blocks
    async fn next_object(&self, client_id: u32) -> CallResult<Option<WorkItem>>;

    async fn put_object(&self, client_id: u32, item: WorkItem, elapsed_millis: u64)
        -> CallResult<()>;

    async fn get_setting(&self, name: &str) -> CallResult<Option<String>>;

    async fn get_settings(&self) -> CallResult<BTreeMap<String, String>>;

    async fn keep_alive_interval(&self) -> CallResult<Duration>;

    async fn keep_alive_max_retries(&self) -> CallResult<u32>;
}

/// Observer of a coordinator's confirmed work
///
/// Called synchronously while the coordinator holds its queue lock, so
/// implementations must be quick and must not call back into the coordinator.
pub trait Consumer: Send + Sync {
    /// A new input file has become the current file
    fn new_file(&self, input: &std::path::Path, output: &std::path::Path);

    /// An item was just confirmed by a client
    fn consume(&self, item: &WorkItem);

    /// Every item of the file has been confirmed
    fn processing_complete(&self, input: &std::path::Path, output: &std::path::Path);
}

/// Liveness listener timeout for a peer pinged at `interval` with `max_retries`
pub fn renewal_timeout(interval: Duration, max_retries: u32) -> Duration {
    interval * (2 * (max_retries + 1))
}

/// Host name of this machine
pub fn local_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renewal_timeout() {
        assert_eq!(
            renewal_timeout(Duration::from_millis(5000), 0),
            Duration::from_millis(10000)
        );
        assert_eq!(
            renewal_timeout(Duration::from_millis(100), 2),
            Duration::from_millis(600)
        );
    }
}
