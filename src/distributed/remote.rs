//! Handles to peers and to the switchboard in other processes
//!
//! Each handle implements the same trait as its in-process counterpart, so the
//! switchboard, the runners, and the fault wrappers never know whether they
//! are talking across a socket.

use super::protocol::*;
use crate::error::{CallResult, SwitchboardError};
use crate::peer::{ClientPeer, Peer, ServerHandle, ServerPeer, SwitchboardApi};
use crate::work::{Payload, WorkItem};
use anyhow::Context;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;

async fn exchange(addr: &str, call: Call) -> anyhow::Result<Reply> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    write_message(&mut stream, &Message::call(call)).await?;
    match read_message(&mut stream).await? {
        Message::Reply(reply) => Ok(reply),
        other => anyhow::bail!("Expected a reply, got {:?}", other),
    }
}

/// One call to the process listening at `addr`, bounded by `timeout`
///
/// Connection, framing, and timeout failures are transport errors; an error
/// reply is converted back into the error the other side raised.
pub async fn call(addr: &str, call: Call, timeout: Duration) -> CallResult<Reply> {
    let reply = match tokio::time::timeout(timeout, exchange(addr, call)).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => return Err(SwitchboardError::transport(format!("{:#}", e))),
        Err(_) => {
            return Err(SwitchboardError::transport(format!(
                "{}: no reply within {:?}",
                addr, timeout
            )))
        }
    };
    match reply {
        Reply::Error(wire) => Err(wire.into()),
        reply => Ok(reply),
    }
}

fn unexpected(reply: Reply) -> SwitchboardError {
    SwitchboardError::protocol(format!("unexpected reply {:?}", reply))
}

/// The switchboard as seen from a peer process
pub struct RemoteSwitchboard {
    addr: String,
    timeout: Duration,
}

impl RemoteSwitchboard {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    async fn call(&self, call: Call) -> CallResult<Reply> {
        self::call(&self.addr, call, self.timeout).await
    }

    fn server_handle(&self, info: Option<ServerInfo>) -> Option<ServerHandle> {
        info.map(|info| {
            Arc::new(RemoteServer::new(info.endpoint, self.timeout).with_id(info.id)) as ServerHandle
        })
    }
}

#[async_trait]
impl SwitchboardApi for RemoteSwitchboard {
    async fn register_client(&self, client: Arc<dyn ClientPeer>) -> CallResult<u32> {
        let endpoint = client
            .endpoint()
            .ok_or_else(|| SwitchboardError::registration("client has no network endpoint"))?;
        match self.call(Call::RegisterClient { endpoint }).await? {
            Reply::Id(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    async fn register_server(&self, server: ServerHandle) -> CallResult<u32> {
        let endpoint = server
            .endpoint()
            .ok_or_else(|| SwitchboardError::registration("server has no network endpoint"))?;
        match self.call(Call::RegisterServer { endpoint }).await? {
            Reply::Id(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    async fn get_server(&self, client_id: u32) -> CallResult<Option<ServerHandle>> {
        match self.call(Call::GetServer { client_id }).await? {
            Reply::Server(info) => Ok(self.server_handle(info)),
            other => Err(unexpected(other)),
        }
    }

    async fn get_server_by_id(
        &self,
        client_id: u32,
        server_id: u32,
    ) -> CallResult<Option<ServerHandle>> {
        match self.call(Call::GetServerById { client_id, server_id }).await? {
            Reply::Server(info) => Ok(self.server_handle(info)),
            other => Err(unexpected(other)),
        }
    }

    async fn next_object(&self, client_id: u32) -> CallResult<Option<WorkItem>> {
        match self.call(Call::NextObject { client_id }).await? {
            Reply::Object(item) => Ok(item),
            other => Err(unexpected(other)),
        }
    }

    async fn put_object(
        &self,
        client_id: u32,
        item: WorkItem,
        elapsed_millis: u64,
    ) -> CallResult<()> {
        let call = Call::PutObject {
            client_id,
            item,
            elapsed_millis,
        };
        match self.call(call).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn get_setting(&self, name: &str) -> CallResult<Option<String>> {
        let call = Call::GetSetting {
            name: name.to_string(),
        };
        match self.call(call).await? {
            Reply::Setting(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn get_settings(&self) -> CallResult<BTreeMap<String, String>> {
        match self.call(Call::GetSettings).await? {
            Reply::Settings(settings) => Ok(settings),
            other => Err(unexpected(other)),
        }
    }

    async fn keep_alive_interval(&self) -> CallResult<Duration> {
        match self.call(Call::KeepAliveInterval).await? {
            Reply::Millis(millis) => Ok(Duration::from_millis(millis)),
            other => Err(unexpected(other)),
        }
    }

    async fn keep_alive_max_retries(&self) -> CallResult<u32> {
        match self.call(Call::KeepAliveMaxRetries).await? {
            Reply::Count(count) => Ok(count),
            other => Err(unexpected(other)),
        }
    }
}

// ===== Calls every peer answers =====

async fn peer_id(endpoint: &str, timeout: Duration) -> CallResult<u32> {
    match call(endpoint, Call::Id, timeout).await? {
        Reply::Id(id) => Ok(id),
        other => Err(unexpected(other)),
    }
}

async fn peer_host(endpoint: &str, timeout: Duration) -> CallResult<String> {
    match call(endpoint, Call::Host, timeout).await? {
        Reply::Host(host) => Ok(host),
        other => Err(unexpected(other)),
    }
}

async fn peer_alive(endpoint: &str, timeout: Duration) -> CallResult<bool> {
    match call(endpoint, Call::Alive, timeout).await? {
        Reply::Bool(alive) => Ok(alive),
        other => Err(unexpected(other)),
    }
}

async fn peer_die(endpoint: &str, immediate: bool, timeout: Duration) -> CallResult<()> {
    match call(endpoint, Call::Die { immediate }, timeout).await? {
        Reply::Done => Ok(()),
        other => Err(unexpected(other)),
    }
}

/// A client in another process, as the switchboard sees it
pub struct RemoteClient {
    endpoint: String,
    timeout: Duration,
}

impl RemoteClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Peer for RemoteClient {
    async fn id(&self) -> CallResult<u32> {
        peer_id(&self.endpoint, self.timeout).await
    }

    async fn host(&self) -> CallResult<String> {
        peer_host(&self.endpoint, self.timeout).await
    }

    async fn alive(&self) -> CallResult<bool> {
        peer_alive(&self.endpoint, self.timeout).await
    }

    async fn die(&self, immediate: bool) -> CallResult<()> {
        peer_die(&self.endpoint, immediate, self.timeout).await
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.endpoint.clone())
    }
}

#[async_trait]
impl ClientPeer for RemoteClient {
    async fn server_down(&self, server_id: u32) -> CallResult<()> {
        match call(&self.endpoint, Call::ServerDown { server_id }, self.timeout).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

/// A server in another process
///
/// Used by the switchboard for liveness and capacity calls, and by clients
/// for the service itself.
pub struct RemoteServer {
    endpoint: String,
    timeout: Duration,
    id: OnceLock<u32>,
}

impl RemoteServer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
            id: OnceLock::new(),
        }
    }

    /// Answer `id` locally with the id the switchboard reported
    pub fn with_id(self, id: u32) -> Self {
        self.remember_id(id);
        self
    }

    /// Record the id assigned at registration; later calls are ignored
    pub fn remember_id(&self, id: u32) {
        let _ = self.id.set(id);
    }
}

#[async_trait]
impl Peer for RemoteServer {
    async fn id(&self) -> CallResult<u32> {
        match self.id.get() {
            Some(id) => Ok(*id),
            None => peer_id(&self.endpoint, self.timeout).await,
        }
    }

    async fn host(&self) -> CallResult<String> {
        peer_host(&self.endpoint, self.timeout).await
    }

    async fn alive(&self) -> CallResult<bool> {
        peer_alive(&self.endpoint, self.timeout).await
    }

    async fn die(&self, immediate: bool) -> CallResult<()> {
        peer_die(&self.endpoint, immediate, self.timeout).await
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.endpoint.clone())
    }
}

#[async_trait]
impl ServerPeer for RemoteServer {
    async fn max_clients(&self) -> CallResult<i32> {
        match call(&self.endpoint, Call::MaxClients, self.timeout).await? {
            Reply::MaxClients(max) => Ok(max),
            other => Err(unexpected(other)),
        }
    }

    async fn accept_only_by_request(&self) -> CallResult<bool> {
        match call(&self.endpoint, Call::AcceptOnlyByRequest, self.timeout).await? {
            Reply::Bool(by_request) => Ok(by_request),
            other => Err(unexpected(other)),
        }
    }

    async fn serve(&self, request: Payload) -> CallResult<Payload> {
        match call(&self.endpoint, Call::Serve { request }, self.timeout).await? {
            Reply::Payload(answer) => Ok(answer),
            other => Err(unexpected(other)),
        }
    }
}
