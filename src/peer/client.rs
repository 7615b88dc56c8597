//! Client peer and its runner
//!
//! A client registers with the switchboard, optionally gets a server, and
//! then loops pulling work items, processing them, and putting the results
//! back. A liveness listener watches for the switchboard's pings; when they
//! stop arriving the client assumes the switchboard restarted and registers
//! again.

use super::lifecycle::{Lifecycle, Renewal};
use super::{local_host, renewal_timeout, ClientPeer, Peer, ServerHandle, SwitchboardApi};
use crate::config::CLIENT_NEXT_OBJECT_INTERVAL;
use crate::error::{CallResult, SwitchboardError};
use crate::fault::{Failover, Retry, RetryPolicy};
use crate::util::time::Timestamp;
use crate::work::Payload;
use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Turns one payload into its result
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process `payload`, possibly with the help of the assigned server
    async fn process(&self, payload: Payload, server: Option<&ServerHandle>)
        -> CallResult<Payload>;

    /// Whether this processor needs a server assigned before it can work
    fn needs_server(&self) -> bool {
        true
    }
}

/// Processor that hands every payload to the assigned server
pub struct ServeProcessor;

#[async_trait]
impl Processor for ServeProcessor {
    async fn process(
        &self,
        payload: Payload,
        server: Option<&ServerHandle>,
    ) -> CallResult<Payload> {
        match server {
            Some(server) => server.serve(payload).await,
            None => Err(SwitchboardError::transport("no server assigned")),
        }
    }
}

/// The in-process client peer the switchboard talks to
pub struct LocalClient {
    id: AtomicU32,
    host: String,
    endpoint: Option<String>,
    lifecycle: Arc<Lifecycle>,
    server_down: AtomicBool,
}

impl LocalClient {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            id: AtomicU32::new(0),
            host: local_host(),
            endpoint,
            lifecycle: Arc::new(Lifecycle::new()),
            server_down: AtomicBool::new(false),
        }
    }

    pub fn current_id(&self) -> u32 {
        self.id.load(Ordering::SeqCst)
    }

    fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::SeqCst);
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Whether the switchboard reported the server as down since the last check
    fn take_server_down(&self) -> bool {
        self.server_down.swap(false, Ordering::SeqCst)
    }
}

#[async_trait]
impl Peer for LocalClient {
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
            "client No. {}: told to die{}",
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
impl ClientPeer for LocalClient {
    async fn server_down(&self, server_id: u32) -> CallResult<()> {
        info!("client No. {}: server No. {} went down", self.current_id(), server_id);
        self.server_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Client runner behavior
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Address the switchboard can reach this client at
    pub endpoint: Option<String>,
    /// Retries for failed server calls, and the sleep between failed
    /// registrations
    pub retry: RetryPolicy,
    /// Ask the switchboard for a replacement when the server fails
    pub failover: bool,
    /// Sleep when no work is available; replaced by the switchboard's setting
    pub next_object_interval: Duration,
    /// Upper bound on the random delay before each registration attempt
    pub register_jitter: Duration,
    /// How long a graceful death waits for the final liveness ping
    pub die_grace: Duration,
    /// Ask for this server instead of the least-loaded one
    pub server_id: Option<u32>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            retry: RetryPolicy::indefinitely(Duration::from_secs(1)),
            failover: true,
            next_object_interval: Duration::from_secs(10),
            register_jitter: Duration::from_millis(500),
            die_grace: Duration::from_secs(120),
            server_id: None,
        }
    }
}

/// Drives a [`LocalClient`] against a switchboard
pub struct ClientRunner<P> {
    switchboard: Arc<dyn SwitchboardApi>,
    client: Arc<LocalClient>,
    processor: P,
    options: ClientOptions,
    server: tokio::sync::Mutex<Option<ServerHandle>>,
    next_object_interval_ms: AtomicU64,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Processor + 'static> ClientRunner<P> {
    pub fn new(switchboard: Arc<dyn SwitchboardApi>, processor: P, options: ClientOptions) -> Arc<Self> {
        let client = Arc::new(LocalClient::new(options.endpoint.clone()));
        Arc::new(Self {
            switchboard,
            client,
            processor,
            next_object_interval_ms: AtomicU64::new(options.next_object_interval.as_millis() as u64),
            options,
            server: tokio::sync::Mutex::new(None),
            listener: Mutex::new(None),
        })
    }

    pub fn client(&self) -> &Arc<LocalClient> {
        &self.client
    }

    pub fn next_object_interval(&self) -> Duration {
        Duration::from_millis(self.next_object_interval_ms.load(Ordering::SeqCst))
    }

    /// Register, start the liveness listener, and get a server if one is needed
    pub async fn start(self: &Arc<Self>) -> CallResult<u32> {
        let id = self.register().await?;

        let interval = self.switchboard.keep_alive_interval().await?;
        let max_retries = self.switchboard.keep_alive_max_retries().await?;
        let timeout = renewal_timeout(interval, max_retries);
        let runner = Arc::clone(self);
        let listener = tokio::spawn(async move { runner.listen(timeout).await });
        if let Some(old) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(listener)
        {
            old.abort();
        }

        if self.processor.needs_server() {
            self.acquire_server().await?;
        }
        Ok(id)
    }

    /// Register until the switchboard accepts or this client is told to die
    pub async fn register(&self) -> CallResult<u32> {
        let lifecycle = self.client.lifecycle();
        loop {
            if lifecycle.time_to_die() {
                return Err(SwitchboardError::registration("shutting down before registration"));
            }

            let jitter = self.options.register_jitter.as_millis() as u64;
            if jitter > 0 {
                let delay = rand::thread_rng().gen_range(0..=jitter);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            match self.switchboard.register_client(self.client.clone()).await {
                Ok(id) => {
                    self.client.set_id(id);
                    info!("registered with the switchboard as client No. {}", id);
                    self.read_next_object_interval().await;
                    return Ok(id);
                }
                Err(e) => {
                    warn!("error registering ({}); retrying in {:?}", e, self.options.retry.sleep);
                    tokio::time::sleep(self.options.retry.sleep).await;
                }
            }
        }
    }

    async fn read_next_object_interval(&self) {
        let setting = match self.switchboard.get_setting(CLIENT_NEXT_OBJECT_INTERVAL).await {
            Ok(Some(value)) => value,
            Ok(None) => return,
            Err(e) => {
                debug!("could not read {} ({})", CLIENT_NEXT_OBJECT_INTERVAL, e);
                return;
            }
        };
        match setting.parse::<u64>() {
            Ok(millis) => self.next_object_interval_ms.store(millis, Ordering::SeqCst),
            Err(_) => warn!("ignoring bad {} value {:?}", CLIENT_NEXT_OBJECT_INTERVAL, setting),
        }
    }

    /// Re-register whenever the switchboard's pings stop arriving
    async fn listen(self: Arc<Self>, timeout: Duration) {
        let mut renewals = self.client.lifecycle().renewal_watch();
        loop {
            match renewals.next(timeout).await {
                Renewal::Renewed => {}
                Renewal::Dying => break,
                Renewal::TimedOut => {
                    warn!(
                        "client No. {}: no liveness ping within {:?}; switchboard must have gone down",
                        self.client.current_id(),
                        timeout
                    );
                    if let Err(e) = self.reregister().await {
                        warn!("re-registration abandoned ({})", e);
                        break;
                    }
                }
            }
        }
        debug!("client No. {}: liveness listener stopped", self.client.current_id());
    }

    async fn reregister(&self) -> CallResult<()> {
        self.server.lock().await.take();
        self.register().await?;
        info!("client No. {}: successfully re-registered", self.client.current_id());
        if self.processor.needs_server() {
            self.acquire_server().await?;
        }
        Ok(())
    }

    /// Wrap `server` in the configured retry and failover handling
    ///
    /// With no retries and no failover the handle is returned as is.
    pub fn tolerate_faults(&self, server: ServerHandle) -> ServerHandle {
        if self.options.retry.retries == Some(0) && !self.options.failover {
            return server;
        }
        let server: ServerHandle = if self.options.failover {
            Arc::new(Failover::new(
                Some(server),
                self.switchboard.clone(),
                self.client.clone(),
            ))
        } else {
            server
        };
        Arc::new(Retry::new(server, self.options.retry).owned_by(self.client.lifecycle().clone()))
    }

    /// Ask the switchboard for a server until one is assigned
    pub async fn get_server(&self) -> CallResult<ServerHandle> {
        let lifecycle = self.client.lifecycle();
        loop {
            if lifecycle.time_to_die() {
                return Err(SwitchboardError::transport("shutting down while waiting for a server"));
            }

            let client_id = self.client.current_id();
            let found = match self.options.server_id {
                Some(server_id) => self.switchboard.get_server_by_id(client_id, server_id).await,
                None => self.switchboard.get_server(client_id).await,
            };
            match found {
                Ok(Some(server)) => return Ok(server),
                Ok(None) => debug!("client No. {}: waiting for a server", client_id),
                Err(SwitchboardError::UnrecognizedClient(_)) => {
                    warn!("client No. {} is no longer registered", client_id);
                    self.register().await?;
                    continue;
                }
                Err(e) if e.is_transient() => warn!("error getting a server ({})", e),
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.options.retry.sleep) => {}
                _ = lifecycle.until_time_to_die() => {}
            }
        }
    }

    async fn acquire_server(&self) -> CallResult<ServerHandle> {
        let server = self.tolerate_faults(self.get_server().await?);
        *self.server.lock().await = Some(server.clone());
        Ok(server)
    }

    async fn current_server(&self) -> CallResult<Option<ServerHandle>> {
        if !self.processor.needs_server() {
            return Ok(None);
        }
        if self.client.take_server_down() {
            self.server.lock().await.take();
        }
        let held = self.server.lock().await.clone();
        match held {
            Some(server) => Ok(Some(server)),
            None => self.acquire_server().await.map(Some),
        }
    }

    /// Sleep the polling interval, waking early on death
    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.next_object_interval()) => {}
            _ = self.client.lifecycle().until_time_to_die() => {}
        }
    }

    /// Pull, process, and return work items until told to die
    ///
    /// A failed processing step returns the item unprocessed with its
    /// original payload. Returns the number of items put back.
    pub async fn process_objects(&self) -> CallResult<u64> {
        let lifecycle = self.client.lifecycle().clone();
        let mut num_processed = 0;

        while !lifecycle.time_to_die() {
            let server = match self.current_server().await {
                Ok(server) => server,
                Err(_) if lifecycle.time_to_die() => break,
                Err(e) => return Err(e),
            };

            let client_id = self.client.current_id();
            let item = match self.switchboard.next_object(client_id).await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    self.idle().await;
                    continue;
                }
                Err(e) => {
                    self.switchboard_failure(e).await?;
                    continue;
                }
            };

            let started = Timestamp::now();
            let mut result = item.clone();
            match self.processor.process(item.payload().clone(), server.as_ref()).await {
                Ok(payload) => {
                    result.set_payload(payload);
                    result.set_processed(true);
                }
                Err(e) => warn!(
                    "client No. {}: error processing object No. {} ({})",
                    client_id,
                    item.number(),
                    e
                ),
            }
            let elapsed = started.elapsed_millis();

            match self.switchboard.put_object(client_id, result, elapsed).await {
                Ok(()) => num_processed += 1,
                Err(e @ SwitchboardError::Protocol { .. }) => {
                    warn!("client No. {}: result rejected ({})", client_id, e)
                }
                Err(e) => self.switchboard_failure(e).await?,
            }
        }

        info!("client No. {}: processed {} objects", self.client.current_id(), num_processed);
        Ok(num_processed)
    }

    /// React to a failed switchboard call inside the processing loop
    async fn switchboard_failure(&self, err: SwitchboardError) -> CallResult<()> {
        match err {
            SwitchboardError::UnrecognizedClient(_) => {
                warn!("switchboard no longer knows this client ({}); re-registering", err);
                self.reregister().await
            }
            e if e.is_transient() => {
                warn!("switchboard must have gone down ({}); will retry", e);
                self.idle().await;
                Ok(())
            }
            e => Err(e),
        }
    }

    /// Process until told to die, then wait until fully dead
    pub async fn process_objects_then_die(&self) -> CallResult<u64> {
        let num_processed = self.process_objects().await?;
        self.client.lifecycle().wait_until_dead(self.options.die_grace).await;
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
        Ok(num_processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwitchboardConfig;
    use crate::peer::mock::MockServer;
    use crate::switchboard::Switchboard;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    struct Upper;

    #[async_trait]
    impl Processor for Upper {
        async fn process(
            &self,
            payload: Payload,
            _server: Option<&ServerHandle>,
        ) -> CallResult<Payload> {
            let text = payload.as_str().unwrap_or_default().to_uppercase();
            if text.contains("BAD") {
                return Err(SwitchboardError::service("cannot handle this one"));
            }
            Ok(json!(text))
        }

        fn needs_server(&self) -> bool {
            false
        }
    }

    fn fast_options() -> ClientOptions {
        ClientOptions {
            retry: RetryPolicy::new(Some(2), Duration::from_millis(5)),
            next_object_interval: Duration::from_millis(5),
            register_jitter: Duration::ZERO,
            die_grace: Duration::from_millis(50),
            ..ClientOptions::default()
        }
    }

    fn fast_switchboard() -> Arc<Switchboard> {
        let mut config = SwitchboardConfig::default();
        config.coordinator.keep_alive_interval_ms = 10;
        config.coordinator.keep_alive_max_retries = 20;
        config.client.next_object_interval_ms = 5;
        Switchboard::new(config)
    }

    #[tokio::test]
    async fn test_local_client_liveness() {
        let client = LocalClient::new(None);
        assert!(client.alive().await.unwrap());
        client.die(false).await.unwrap();
        assert!(!client.alive().await.unwrap());
        assert!(client.lifecycle().is_dead());
    }

    #[tokio::test]
    async fn test_serve_processor_requires_server() {
        let err = ServeProcessor.process(json!("x"), None).await.unwrap_err();
        assert!(err.is_transient());

        let server: ServerHandle = Arc::new(MockServer::new(1));
        let answer = ServeProcessor.process(json!("x"), Some(&server)).await.unwrap();
        assert_eq!(answer, json!("x"));
    }

    #[tokio::test]
    async fn test_register_reads_polling_interval() {
        let switchboard = fast_switchboard();
        let options = ClientOptions {
            next_object_interval: Duration::from_secs(1),
            ..fast_options()
        };
        let runner = ClientRunner::new(switchboard.clone(), Upper, options);
        let id = runner.start().await.unwrap();
        assert_eq!(runner.client().current_id(), id);
        assert_eq!(runner.next_object_interval(), Duration::from_millis(5));
        switchboard.cleanup().await;
    }

    #[tokio::test]
    async fn test_runner_processes_file_until_cleanup() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input.txt");
        fs::write(&input, "one\nbad two\nthree\n").unwrap();

        let switchboard = fast_switchboard();
        let runner = ClientRunner::new(switchboard.clone(), Upper, fast_options());
        runner.start().await.unwrap();

        let worker = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.process_objects_then_die().await })
        };

        switchboard.process_file(&input, None, None).unwrap();
        switchboard.cleanup_when_all_files_are_done().await;
        let processed = worker.await.unwrap().unwrap();
        assert_eq!(processed, 3);

        // the failed item keeps its original payload
        let output = fs::read_to_string(dir.path().join("input.txt.proc")).unwrap();
        assert_eq!(output, "ONE\nbad two\nTHREE\n");
    }

    #[tokio::test]
    async fn test_runner_gets_fault_tolerant_server() {
        let switchboard = fast_switchboard();
        let server = Arc::new(MockServer::new(2));
        switchboard.register_server(server.clone()).await.unwrap();

        let runner = ClientRunner::new(switchboard.clone(), ServeProcessor, fast_options());
        runner.start().await.unwrap();

        server.fail_next_calls(1);
        let held = runner.current_server().await.unwrap().unwrap();
        assert_eq!(held.serve(json!("ping")).await.unwrap(), json!("ping"));
        switchboard.cleanup().await;
    }

    #[tokio::test]
    async fn test_unregistered_client_registers_again() {
        let switchboard = fast_switchboard();
        let runner = ClientRunner::new(switchboard.clone(), Upper, fast_options());
        runner.register().await.unwrap();

        runner
            .switchboard_failure(SwitchboardError::UnrecognizedClient(99))
            .await
            .unwrap();
        assert_eq!(switchboard.status().await.clients, 2);
        assert_eq!(runner.client().current_id(), 1);
        switchboard.cleanup().await;
    }
}
