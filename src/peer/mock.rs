//! Mock peers for testing
//!
//! Scripted in-process clients and servers. They never touch the network, and
//! every call they receive is recorded so tests can assert on what the
//! coordinator did to them.
//!
//! # Features
//!
//! - Liveness answers can be switched between healthy, unreachable, and
//!   shutting down
//! - Records `die` and `server_down` calls
//! - Servers can fail a number of upcoming calls with a transport error
//! - Declared capacity and by-request policy can change between calls

use super::{ClientPeer, Peer, ServerPeer, ACCEPT_UNLIMITED_CLIENTS};
use crate::error::{CallResult, SwitchboardError};
use crate::work::Payload;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

/// How a mock answers liveness pings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliveScript {
    Healthy,
    /// Every ping fails with a transport error
    Unreachable,
    /// Pings answer `false`
    ShuttingDown,
}

type DieHook = Box<dyn Fn(bool) + Send + Sync>;

/// Scripted client peer
pub struct MockClient {
    id: AtomicU32,
    host: String,
    alive: Mutex<AliveScript>,
    alive_calls: AtomicUsize,
    fail_host: AtomicBool,
    die_calls: Mutex<Vec<bool>>,
    server_down_calls: Mutex<Vec<u32>>,
    on_die: Mutex<Option<DieHook>>,
}

impl MockClient {
    pub fn new(host: &str) -> Self {
        Self {
            id: AtomicU32::new(0),
            host: host.to_string(),
            alive: Mutex::new(AliveScript::Healthy),
            alive_calls: AtomicUsize::new(0),
            fail_host: AtomicBool::new(false),
            die_calls: Mutex::new(Vec::new()),
            server_down_calls: Mutex::new(Vec::new()),
            on_die: Mutex::new(None),
        }
    }

    pub fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::SeqCst);
    }

    pub fn set_alive(&self, script: AliveScript) {
        *self.alive.lock().unwrap() = script;
    }

    /// Make the `host` call fail, which fails registration
    pub fn fail_host(&self) {
        self.fail_host.store(true, Ordering::SeqCst);
    }

    /// Run `hook` inside every `die` call
    pub fn on_die(&self, hook: impl Fn(bool) + Send + Sync + 'static) {
        *self.on_die.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn alive_calls(&self) -> usize {
        self.alive_calls.load(Ordering::SeqCst)
    }

    pub fn die_calls(&self) -> Vec<bool> {
        self.die_calls.lock().unwrap().clone()
    }

    pub fn server_down_calls(&self) -> Vec<u32> {
        self.server_down_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Peer for MockClient {
    async fn id(&self) -> CallResult<u32> {
        Ok(self.id.load(Ordering::SeqCst))
    }

    async fn host(&self) -> CallResult<String> {
        if self.fail_host.load(Ordering::SeqCst) {
            return Err(SwitchboardError::transport("host lookup failed"));
        }
        Ok(self.host.clone())
    }

    async fn alive(&self) -> CallResult<bool> {
        self.alive_calls.fetch_add(1, Ordering::SeqCst);
        answer(*self.alive.lock().unwrap())
    }

    async fn die(&self, immediate: bool) -> CallResult<()> {
        self.die_calls.lock().unwrap().push(immediate);
        if let Some(hook) = self.on_die.lock().unwrap().as_ref() {
            hook(immediate);
        }
        Ok(())
    }
}

#[async_trait]
impl ClientPeer for MockClient {
    async fn server_down(&self, server_id: u32) -> CallResult<()> {
        self.server_down_calls.lock().unwrap().push(server_id);
        Ok(())
    }
}

/// Scripted server peer whose service echoes its request
pub struct MockServer {
    id: AtomicU32,
    host: String,
    max_clients: AtomicI32,
    by_request: AtomicBool,
    alive: Mutex<AliveScript>,
    fail_capacity: AtomicBool,
    failures_left: AtomicUsize,
    serve_calls: AtomicUsize,
    die_calls: Mutex<Vec<bool>>,
}

impl MockServer {
    pub fn new(max_clients: i32) -> Self {
        Self {
            id: AtomicU32::new(0),
            host: "server.local".to_string(),
            max_clients: AtomicI32::new(max_clients),
            by_request: AtomicBool::new(false),
            alive: Mutex::new(AliveScript::Healthy),
            fail_capacity: AtomicBool::new(false),
            failures_left: AtomicUsize::new(0),
            serve_calls: AtomicUsize::new(0),
            die_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(ACCEPT_UNLIMITED_CLIENTS)
    }

    pub fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::SeqCst);
    }

    pub fn set_max_clients(&self, max_clients: i32) {
        self.max_clients.store(max_clients, Ordering::SeqCst);
    }

    pub fn set_accept_only_by_request(&self, by_request: bool) {
        self.by_request.store(by_request, Ordering::SeqCst);
    }

    pub fn set_alive(&self, script: AliveScript) {
        *self.alive.lock().unwrap() = script;
    }

    /// Make capacity queries fail with a transport error
    pub fn fail_capacity(&self, fail: bool) {
        self.fail_capacity.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `n` `serve` calls with a transport error
    pub fn fail_next_calls(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn serve_calls(&self) -> usize {
        self.serve_calls.load(Ordering::SeqCst)
    }

    pub fn die_calls(&self) -> Vec<bool> {
        self.die_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Peer for MockServer {
    async fn id(&self) -> CallResult<u32> {
        Ok(self.id.load(Ordering::SeqCst))
    }

    async fn host(&self) -> CallResult<String> {
        Ok(self.host.clone())
    }

    async fn alive(&self) -> CallResult<bool> {
        answer(*self.alive.lock().unwrap())
    }

    async fn die(&self, immediate: bool) -> CallResult<()> {
        self.die_calls.lock().unwrap().push(immediate);
        Ok(())
    }
}

#[async_trait]
impl ServerPeer for MockServer {
    async fn max_clients(&self) -> CallResult<i32> {
        if self.fail_capacity.load(Ordering::SeqCst) {
            return Err(SwitchboardError::transport("capacity query failed"));
        }
        Ok(self.max_clients.load(Ordering::SeqCst))
    }

    async fn accept_only_by_request(&self) -> CallResult<bool> {
        Ok(self.by_request.load(Ordering::SeqCst))
    }

    async fn serve(&self, request: Payload) -> CallResult<Payload> {
        self.serve_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SwitchboardError::transport("connection reset"));
        }
        Ok(request)
    }
}

fn answer(script: AliveScript) -> CallResult<bool> {
    match script {
        AliveScript::Healthy => Ok(true),
        AliveScript::Unreachable => Err(SwitchboardError::transport("peer unreachable")),
        AliveScript::ShuttingDown => Ok(false),
    }
}
