//! Server failover
//!
//! Swaps a client's assigned server for a fresh one from the switchboard when
//! the current one stops answering.

use crate::error::{CallResult, SwitchboardError};
use crate::peer::{ClientPeer, Peer, ServerHandle, ServerPeer, SwitchboardApi};
use crate::work::Payload;
use async_trait::async_trait;
use log::info;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Server handle that replaces itself when a call fails
///
/// A transient failure drops the held handle and asks the coordinator for a
/// new server on behalf of `client`; the call is then re-issued once against
/// the replacement. A second failure is returned to the caller, who may wrap
/// this type in [`crate::fault::Retry`] to keep going.
pub struct Failover {
    current: Mutex<Option<ServerHandle>>,
    switchboard: Arc<dyn SwitchboardApi>,
    client: Arc<dyn ClientPeer>,
}

impl Failover {
    pub fn new(
        server: Option<ServerHandle>,
        switchboard: Arc<dyn SwitchboardApi>,
        client: Arc<dyn ClientPeer>,
    ) -> Self {
        Self {
            current: Mutex::new(server),
            switchboard,
            client,
        }
    }

    /// The held handle, acquiring a fresh one if there is none
    async fn validate(&self) -> CallResult<ServerHandle> {
        let mut current = self.current.lock().await;
        if let Some(server) = current.as_ref() {
            return Ok(server.clone());
        }

        let client_id = self.client.id().await?;
        match self.switchboard.get_server(client_id).await? {
            Some(server) => {
                info!(
                    "client No. {}: failed over to server No. {}",
                    client_id,
                    server.id().await.unwrap_or_default()
                );
                *current = Some(server.clone());
                Ok(server)
            }
            None => Err(SwitchboardError::transport(format!(
                "no server available for client No. {}",
                client_id
            ))),
        }
    }

    async fn invalidate(&self, failed: &ServerHandle) {
        let mut current = self.current.lock().await;
        if current.as_ref().map_or(false, |s| Arc::ptr_eq(s, failed)) {
            *current = None;
        }
    }

    async fn invoke<R, F, Fut>(&self, mut call: F) -> CallResult<R>
    where
        F: FnMut(ServerHandle) -> Fut + Send,
        Fut: Future<Output = CallResult<R>> + Send,
        R: Send,
    {
        let mut replaced = false;
        loop {
            let server = self.validate().await?;
            match call(server.clone()).await {
                Err(e) if e.is_transient() => {
                    self.invalidate(&server).await;
                    if replaced {
                        return Err(e);
                    }
                    replaced = true;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl Peer for Failover {
    async fn id(&self) -> CallResult<u32> {
        self.invoke(|s| async move { s.id().await }).await
    }

    async fn host(&self) -> CallResult<String> {
        self.invoke(|s| async move { s.host().await }).await
    }

    async fn alive(&self) -> CallResult<bool> {
        self.invoke(|s| async move { s.alive().await }).await
    }

    async fn die(&self, immediate: bool) -> CallResult<()> {
        self.invoke(|s| async move { s.die(immediate).await }).await
    }
}

#[async_trait]
impl ServerPeer for Failover {
    async fn max_clients(&self) -> CallResult<i32> {
        self.invoke(|s| async move { s.max_clients().await }).await
    }

    async fn accept_only_by_request(&self) -> CallResult<bool> {
        self.invoke(|s| async move { s.accept_only_by_request().await })
            .await
    }

    async fn serve(&self, request: Payload) -> CallResult<Payload> {
        self.invoke(|s| {
            let request = request.clone();
            async move { s.serve(request).await }
        })
        .await
    }
}
