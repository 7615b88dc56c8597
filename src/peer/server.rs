//! Server peer and its runner

use super::lifecycle::{Lifecycle, Renewal};
use super::{
    local_host, renewal_timeout, Peer, ServerPeer, SwitchboardApi, ACCEPT_UNLIMITED_CLIENTS,
};
use crate::error::{CallResult, SwitchboardError};
use crate::work::Payload;
use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The opaque service a server performs for its clients
#[async_trait]
pub trait Service: Send + Sync {
    async fn serve(&self, request: Payload) -> CallResult<Payload>;
}

/// In-process server peer wrapping a [`Service`]
///
/// Capacity and assignment policy can be changed while registered; the
/// switchboard re-reads both before each assignment.
pub struct LocalServer<S> {
    id: AtomicU32,
    host: String,
    endpoint: Option<String>,
    max_clients: AtomicI32,
    accept_only_by_request: AtomicBool,
    lifecycle: Arc<Lifecycle>,
    service: S,
}

impl<S: Service> LocalServer<S> {
    pub fn new(service: S, max_clients: i32, accept_only_by_request: bool, endpoint: Option<String>) -> Self {
        Self {
            id: AtomicU32::new(0),
            host: local_host(),
            endpoint,
            max_clients: AtomicI32::new(max_clients),
            accept_only_by_request: AtomicBool::new(accept_only_by_request),
            lifecycle: Arc::new(Lifecycle::new()),
            service,
        }
    }

    pub fn current_id(&self) -> u32 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn set_max_clients(&self, max_clients: i32) {
        self.max_clients.store(max_clients, Ordering::SeqCst);
    }

    pub fn set_accept_only_by_request(&self, by_request: bool) {
        self.accept_only_by_request.store(by_request, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: Service> Peer for LocalServer<S> {
    async fn id(&self) -> CallResult<u32> {
        Ok(self.current_id())
    }

    async fn host(&self) -> CallResult<String> {
        Ok(self.host.clone())
    }

    async fn alive(&self) -> CallResult<bool> {
        Ok(self.lifecycle.alive())
    }

    async fn die(&self, immediate: bool) -> CallResult<()> {
        info!(
            "server No. {}: told to die{}",
            self.current_id(),
            if immediate { " immediately" } else { "" }
        );
        self.lifecycle.die(immediate);
        Ok(())
    }

    fn endpoint(&self) -> Option<String> {
        self.endpoint.clone()
    }
}

#[async_trait]
impl<S: Service> ServerPeer for LocalServer<S> {
    async fn max_clients(&self) -> CallResult<i32> {
        Ok(self.max_clients.load(Ordering::SeqCst))
    }

    async fn accept_only_by_request(&self) -> CallResult<bool> {
        Ok(self.accept_only_by_request.load(Ordering::SeqCst))
    }

    async fn serve(&self, request: Payload) -> CallResult<Payload> {
        if self.lifecycle.is_dead() {
            return Err(SwitchboardError::transport("server is shut down"));
        }
        self.service.serve(request).await
    }
}

/// Server runner behavior
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub endpoint: Option<String>,
    /// Declared capacity; 0 accepts any number of clients
    pub max_clients: i32,
    pub accept_only_by_request: bool,
    /// Sleep between failed registrations
    pub retry_sleep: Duration,
    pub register_jitter: Duration,
    /// How long a graceful death waits for the final liveness ping
    pub die_grace: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_clients: ACCEPT_UNLIMITED_CLIENTS,
            accept_only_by_request: false,
            retry_sleep: Duration::from_secs(1),
            register_jitter: Duration::from_millis(500),
            die_grace: Duration::from_secs(120),
        }
    }
}

/// Drives a [`LocalServer`] against a switchboard
pub struct ServerRunner<S> {
    switchboard: Arc<dyn SwitchboardApi>,
    server: Arc<LocalServer<S>>,
    options: ServerOptions,
}

impl<S: Service + 'static> ServerRunner<S> {
    pub fn new(switchboard: Arc<dyn SwitchboardApi>, service: S, options: ServerOptions) -> Self {
        let server = Arc::new(LocalServer::new(
            service,
            options.max_clients,
            options.accept_only_by_request,
            options.endpoint.clone(),
        ));
        Self {
            switchboard,
            server,
            options,
        }
    }

    pub fn server(&self) -> &Arc<LocalServer<S>> {
        &self.server
    }

    /// Register until the switchboard accepts or this server is told to die
    pub async fn register(&self) -> CallResult<u32> {
        register_server(self.switchboard.as_ref(), &self.server, &self.options).await
    }

    /// Register, then serve until told to die
    ///
    /// A liveness listener re-registers whenever the switchboard's pings stop
    /// arriving.
    pub async fn run(&self) -> CallResult<u32> {
        let id = self.register().await?;

        let interval = self.switchboard.keep_alive_interval().await?;
        let max_retries = self.switchboard.keep_alive_max_retries().await?;
        let listener = tokio::spawn(listen(
            self.switchboard.clone(),
            self.server.clone(),
            self.options.clone(),
            renewal_timeout(interval, max_retries),
        ));

        self.server.lifecycle().wait_until_dead(self.options.die_grace).await;
        listener.abort();
        info!("server No. {}: shut down", self.server.current_id());
        Ok(id)
    }
}

async fn register_server<S: Service + 'static>(
    switchboard: &dyn SwitchboardApi,
    server: &Arc<LocalServer<S>>,
    options: &ServerOptions,
) -> CallResult<u32> {
    let declared = server.max_clients.load(Ordering::SeqCst);
    if declared < ACCEPT_UNLIMITED_CLIENTS {
        return Err(SwitchboardError::registration(format!(
            "illegal value for max clients: {}",
            declared
        )));
    }

    loop {
        if server.lifecycle().time_to_die() {
            return Err(SwitchboardError::registration("shutting down before registration"));
        }

        let jitter = options.register_jitter.as_millis() as u64;
        if jitter > 0 {
            let delay = rand::thread_rng().gen_range(0..=jitter);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        match switchboard.register_server(server.clone()).await {
            Ok(id) => {
                server.id.store(id, Ordering::SeqCst);
                info!("registered with the switchboard as server No. {}", id);
                return Ok(id);
            }
            Err(e) => {
                warn!("error registering ({}); retrying in {:?}", e, options.retry_sleep);
                tokio::time::sleep(options.retry_sleep).await;
            }
        }
    }
}

async fn listen<S: Service + 'static>(
    switchboard: Arc<dyn SwitchboardApi>,
    server: Arc<LocalServer<S>>,
    options: ServerOptions,
    timeout: Duration,
) {
    let mut renewals = server.lifecycle().renewal_watch();
    loop {
        match renewals.next(timeout).await {
            Renewal::Renewed => {}
            Renewal::Dying => break,
            Renewal::TimedOut => {
                warn!(
                    "server No. {}: no liveness ping within {:?}; switchboard must have gone down",
                    server.current_id(),
                    timeout
                );
                match register_server(switchboard.as_ref(), &server, &options).await {
                    Ok(id) => info!("successfully re-registered as server No. {}", id),
                    Err(e) => {
                        warn!("re-registration abandoned ({})", e);
                        break;
                    }
                }
            }
        }
    }
    debug!("server No. {}: liveness listener stopped", server.current_id());
}
