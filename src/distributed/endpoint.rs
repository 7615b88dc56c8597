//! Peer endpoint
//!
//! Listens for the switchboard's calls to a local client or server and
//! answers them from the in-process peer. A peer process runs one endpoint
//! for as long as it is registered.

use super::protocol::*;
use crate::error::{CallResult, SwitchboardError};
use crate::peer::PeerHandle;
use anyhow::{Context, Result};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

pub struct PeerEndpoint {
    peer: PeerHandle,
    call_timeout: Duration,
}

impl PeerEndpoint {
    pub fn new(peer: PeerHandle, call_timeout: Duration) -> Self {
        Self { peer, call_timeout }
    }

    /// Bind `listen` and work out the address to advertise
    ///
    /// The advertised address is `advertise_host` (or this machine's host
    /// name) with the port actually bound, so `listen` may use port 0.
    pub async fn bind(listen: &str, advertise_host: Option<&str>) -> Result<(TcpListener, String)> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to bind peer endpoint to {}", listen))?;
        let port = listener
            .local_addr()
            .context("Failed to read listening address")?
            .port();
        let host = match advertise_host {
            Some(host) => host.to_string(),
            None => crate::peer::local_host(),
        };
        Ok((listener, format!("{}:{}", host, port)))
    }

    /// Answer calls until the task is aborted
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .context("Failed to accept connection")?;

            let endpoint = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = endpoint.handle_connection(stream).await {
                    warn!("call from {} failed: {:#}", addr, e);
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let reply = match tokio::time::timeout(self.call_timeout, read_message(&mut stream)).await {
            Ok(Ok(Message::Call(msg))) if msg.protocol_version != PROTOCOL_VERSION => {
                let err = SwitchboardError::protocol(format!(
                    "Protocol version mismatch: switchboard={}, peer={}",
                    msg.protocol_version, PROTOCOL_VERSION
                ));
                Reply::Error(err.to_wire())
            }
            Ok(Ok(Message::Call(msg))) => self
                .dispatch(msg.call)
                .await
                .unwrap_or_else(|e| Reply::Error(e.to_wire())),
            Ok(Ok(other)) => anyhow::bail!("Expected a call, got {:?}", other),
            Ok(Err(e)) => return Err(e),
            Err(_) => anyhow::bail!("No call within {:?}", self.call_timeout),
        };

        write_message(&mut stream, &Message::Reply(reply)).await
    }

    /// Answer one switchboard call
    pub async fn dispatch(&self, call: Call) -> CallResult<Reply> {
        debug!("peer call {:?}", call);
        let reply = match (&self.peer, call) {
            (peer, Call::Id) => Reply::Id(peer.id().await?),
            (peer, Call::Host) => Reply::Host(peer.host().await?),
            (peer, Call::Alive) => Reply::Bool(peer.alive().await?),
            (peer, Call::Die { immediate }) => {
                peer.die(immediate).await?;
                Reply::Done
            }
            (PeerHandle::Client(client), Call::ServerDown { server_id }) => {
                client.server_down(server_id).await?;
                Reply::Done
            }
            (PeerHandle::Server(server), Call::MaxClients) => Reply::MaxClients(server.max_clients().await?),
            (PeerHandle::Server(server), Call::AcceptOnlyByRequest) => {
                Reply::Bool(server.accept_only_by_request().await?)
            }
            (PeerHandle::Server(server), Call::Serve { request }) => {
                Reply::Payload(server.serve(request).await?)
            }
            (_, other) => {
                return Err(SwitchboardError::protocol(format!(
                    "this peer does not answer {:?}",
                    other
                )))
            }
        };
        Ok(reply)
    }
}
