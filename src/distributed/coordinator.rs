//! Switchboard network service
//!
//! Accepts peer connections and dispatches each call to the in-process
//! [`Switchboard`]. Peers that register over the network are represented to
//! the switchboard by [`RemoteClient`] and [`RemoteServer`] handles pointing
//! back at the endpoints they advertised.

use super::protocol::*;
use super::remote::{RemoteClient, RemoteServer};
use crate::error::{CallResult, SwitchboardError};
use crate::peer::{ServerHandle, SwitchboardApi};
use crate::switchboard::Switchboard;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Network front of a [`Switchboard`]
pub struct CoordinatorService {
    switchboard: Arc<Switchboard>,
    call_timeout: Duration,
}

impl CoordinatorService {
    pub fn new(switchboard: Arc<Switchboard>) -> Self {
        let call_timeout = switchboard.config().coordinator.socket_timeout();
        Self {
            switchboard,
            call_timeout,
        }
    }

    /// Bind the listening socket
    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind switchboard service to {}", addr))
    }

    /// Accept connections forever, one task per connection
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(
            "switchboard listening on {}",
            listener.local_addr().context("Failed to read listening address")?
        );

        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .context("Failed to accept connection")?;

            let service = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = service.handle_connection(stream).await {
                    warn!("call from {} failed: {:#}", addr, e);
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let reply = match tokio::time::timeout(self.call_timeout, read_message(&mut stream)).await {
            Ok(Ok(Message::Call(msg))) if msg.protocol_version != PROTOCOL_VERSION => {
                let err = SwitchboardError::protocol(format!(
                    "Protocol version mismatch: peer={}, switchboard={}",
                    msg.protocol_version, PROTOCOL_VERSION
                ));
                Reply::Error(err.to_wire())
            }
            Ok(Ok(Message::Call(msg))) => {
                debug!("call {:?}", msg.call);
                self.dispatch(msg.call)
                    .await
                    .unwrap_or_else(|e| Reply::Error(e.to_wire()))
            }
            Ok(Ok(other)) => anyhow::bail!("Expected a call, got {:?}", other),
            Ok(Err(e)) => return Err(e),
            Err(_) => anyhow::bail!("No call within {:?}", self.call_timeout),
        };

        write_message(&mut stream, &Message::Reply(reply)).await
    }

    /// Answer one peer call
    pub async fn dispatch(&self, call: Call) -> CallResult<Reply> {
        let switchboard = &self.switchboard;
        let reply = match call {
            Call::RegisterClient { endpoint } => {
                let client = Arc::new(RemoteClient::new(endpoint, self.call_timeout));
                Reply::Id(switchboard.register_client(client).await?)
            }
            Call::RegisterServer { endpoint } => {
                let server = Arc::new(RemoteServer::new(endpoint, self.call_timeout));
                let id = switchboard.register_server(server.clone()).await?;
                server.remember_id(id);
                Reply::Id(id)
            }
            Call::GetServer { client_id } => {
                let server = switchboard.get_server(client_id).await?;
                Reply::Server(server_info(server).await?)
            }
            Call::GetServerById {
                client_id,
                server_id,
            } => {
                let server = switchboard.get_server_by_id(client_id, server_id).await?;
                Reply::Server(server_info(server).await?)
            }
            Call::NextObject { client_id } => Reply::Object(switchboard.next_object(client_id).await?),
            Call::PutObject {
                client_id,
                item,
                elapsed_millis,
            } => {
                switchboard.put_object(client_id, item, elapsed_millis).await?;
                Reply::Done
            }
            Call::GetSetting { name } => Reply::Setting(switchboard.get_setting(&name).await?),
            Call::GetSettings => Reply::Settings(switchboard.get_settings().await?),
            Call::KeepAliveInterval => {
                Reply::Millis(switchboard.keep_alive_interval().await?.as_millis() as u64)
            }
            Call::KeepAliveMaxRetries => Reply::Count(switchboard.keep_alive_max_retries().await?),
            other => {
                return Err(SwitchboardError::protocol(format!(
                    "{:?} is a peer call, not a switchboard call",
                    other
                )))
            }
        };
        Ok(reply)
    }
}

/// Where a peer process can reach an assigned server
async fn server_info(server: Option<ServerHandle>) -> CallResult<Option<ServerInfo>> {
    let server = match server {
        Some(server) => server,
        None => return Ok(None),
    };
    let endpoint = server
        .endpoint()
        .ok_or_else(|| SwitchboardError::transport("assigned server has no network endpoint"))?;
    Ok(Some(ServerInfo {
        id: server.id().await?,
        endpoint,
    }))
}
