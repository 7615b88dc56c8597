//! The switchboard: registration, assignment, and the durable work queue
//!
//! # Architecture
//!
//! - `registry`: client and server tables plus the load ordering of servers
//! - `file_unit`: one submitted file (ingest, recovery, dump)
//! - `queue`: retry queue, file units, consumers
//! - `liveness`: keep-alive tasks and death reports
//!
//! # Locking
//!
//! The registry sits behind an async mutex because assignment re-queries a
//! server while holding it. The queue sits behind a plain mutex and is never
//! held across an await; consumers run under it. When both are needed the
//! registry is always taken first.

pub mod file_unit;
pub mod liveness;
pub mod queue;
pub mod registry;

use crate::config::SwitchboardConfig;
use crate::error::{CallResult, SwitchboardError};
use crate::peer::{
    ClientPeer, Consumer, PeerHandle, ServerHandle, SwitchboardApi,
};
use crate::util::time::{average_per_object, calculate_rate, format_duration, format_rate};
use crate::work::WorkItem;
use async_trait::async_trait;
use file_unit::{FileCodecs, FilePaths};
use liveness::{KeepAlive, PeerDeath, PeerKind};
use log::{debug, error, info, warn};
use queue::{QueueOptions, Settled, WorkQueue};
use registry::{effective_capacity, ClientRecord, Registry, ServerRecord};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub use file_unit::DumpJob;

/// Processing state of a submitted file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Done,
    Failed(String),
}

/// Point-in-time counts for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub clients: usize,
    pub servers: usize,
    pub in_flight: usize,
    pub retry_queue: usize,
    pub active_files: usize,
    pub unopened_files: usize,
    pub pending_files: usize,
    pub objects_processed: u64,
}

#[derive(Default)]
struct Progress {
    started: Option<Instant>,
    processed: u64,
}

pub struct Switchboard {
    config: SwitchboardConfig,
    settings: BTreeMap<String, String>,
    registry: tokio::sync::Mutex<Registry>,
    queue: Mutex<WorkQueue>,
    deaths: mpsc::UnboundedSender<PeerDeath>,
    files: Mutex<HashMap<u32, watch::Sender<FileStatus>>>,
    pending_files: watch::Sender<usize>,
    dumps: Mutex<Vec<JoinHandle<()>>>,
    progress: Mutex<Progress>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Switchboard {
    /// Create a switchboard and start its death supervisor
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: SwitchboardConfig) -> Arc<Self> {
        let files = &config.files;
        let options = QueueOptions {
            codecs: FileCodecs {
                input: files.input_codec.codec(),
                log: files.log_codec.codec(),
                output: files.output_codec.codec(),
                buf_size: config.coordinator.buf_size,
            },
            max_open_files: config.coordinator.max_open_files,
            clobber: config.coordinator.clobber,
            reprocess: config.coordinator.reprocess_unfinished,
            sort_output: config.coordinator.sort_output,
        };
        let settings = config.settings();
        let (deaths, death_rx) = mpsc::unbounded_channel();
        let (pending_files, _) = watch::channel(0);

        Arc::new_cyclic(|weak: &Weak<Switchboard>| {
            tokio::spawn(supervise(weak.clone(), death_rx));
            Self {
                config,
                settings,
                registry: tokio::sync::Mutex::new(Registry::default()),
                queue: Mutex::new(WorkQueue::new(options)),
                deaths,
                files: Mutex::new(HashMap::new()),
                pending_files,
                dumps: Mutex::new(Vec::new()),
                progress: Mutex::new(Progress::default()),
            }
        })
    }

    pub fn config(&self) -> &SwitchboardConfig {
        &self.config
    }

    fn call_timeout(&self) -> Duration {
        self.config.coordinator.socket_timeout()
    }

    fn keep_alive(&self) -> KeepAlive {
        KeepAlive {
            interval: self.config.coordinator.keep_alive_interval(),
            max_retries: self.config.coordinator.keep_alive_max_retries,
            call_timeout: self.call_timeout(),
        }
    }

    /// Run a call to a peer under the socket timeout
    async fn bounded<T>(&self, call: impl Future<Output = CallResult<T>>) -> CallResult<T> {
        match tokio::time::timeout(self.call_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(SwitchboardError::transport(format!(
                "no answer within {:?}",
                self.call_timeout()
            ))),
        }
    }

    // ===== Files =====

    /// Submit an input file for processing and return its file id
    ///
    /// Missing output and log paths are derived from the input name. An
    /// error opening or recovering the file is returned here and the file is
    /// not queued.
    pub fn process_file(
        &self,
        input: impl Into<PathBuf>,
        output: Option<PathBuf>,
        log: Option<PathBuf>,
    ) -> CallResult<u32> {
        let files = &self.config.files;
        let paths = FilePaths::resolve(
            input.into(),
            output,
            log,
            &files.output_suffix,
            &files.log_suffix,
        );
        let input = paths.input.clone();

        let (id, settled) = {
            let mut queue = lock(&self.queue);
            let (id, settled) = queue.submit(paths)?;
            let (status, _) = watch::channel(FileStatus::Pending);
            lock(&self.files).insert(id, status);
            self.pending_files.send_modify(|n| *n += 1);
            (id, settled)
        };

        info!("processing file No. {}: {}", id, input.display());
        self.settle(settled);
        Ok(id)
    }

    /// Submit a file and wait until every item in it is confirmed
    pub async fn process_file_and_wait(
        &self,
        input: impl Into<PathBuf>,
        output: Option<PathBuf>,
        log: Option<PathBuf>,
    ) -> CallResult<u32> {
        let id = self.process_file(input, output, log)?;
        self.wait_for_file(id).await?;
        Ok(id)
    }

    /// Wait until every item of a submitted file is confirmed
    pub async fn wait_for_file(&self, file_id: u32) -> CallResult<()> {
        let mut status = match lock(&self.files).get(&file_id) {
            Some(sender) => sender.subscribe(),
            None => {
                return Err(SwitchboardError::protocol(format!(
                    "no file No. {} was submitted",
                    file_id
                )))
            }
        };
        let outcome = match status.wait_for(|s| *s != FileStatus::Pending).await {
            Ok(state) => state.clone(),
            Err(_) => FileStatus::Failed("switchboard shut down".to_string()),
        };
        match outcome {
            FileStatus::Failed(message) => Err(SwitchboardError::service(message)),
            _ => Ok(()),
        }
    }

    /// Wait until no submitted file is pending
    pub async fn wait_until_all_files_are_done(&self) {
        let mut pending = self.pending_files.subscribe();
        let _ = pending.wait_for(|n| *n == 0).await;
    }

    /// Wait until every output file that has been started is written
    pub async fn wait_for_dumps(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = lock(&self.dumps).drain(..).collect();
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("output writer task failed: {}", e);
                }
            }
        }
    }

    /// Wait for every file and its output, then shut all peers down
    pub async fn cleanup_when_all_files_are_done(&self) {
        self.wait_until_all_files_are_done().await;
        self.wait_for_dumps().await;
        self.cleanup().await;
    }

    /// Ask every registered peer to die immediately
    pub async fn cleanup(&self) {
        let peers: Vec<(PeerKind, u32, PeerHandle)> = {
            let registry = self.registry.lock().await;
            let clients = registry
                .clients
                .values()
                .map(|c| (PeerKind::Client, c.id, PeerHandle::Client(c.peer.clone())));
            let servers = registry
                .servers
                .values()
                .map(|s| (PeerKind::Server, s.id, PeerHandle::Server(s.peer.clone())));
            clients.chain(servers).collect()
        };

        info!("telling {} peers to die", peers.len());
        for (kind, id, peer) in peers {
            if let Err(e) = self.bounded(peer.die(true)).await {
                warn!("{} No. {}: die call failed ({})", kind, id, e);
            }
        }
    }

    /// Add a consumer; it hears about the current file before this returns
    pub fn register_consumer(&self, consumer: Arc<dyn Consumer>) {
        lock(&self.queue).register_consumer(consumer);
    }

    /// Items waiting for redelivery
    pub fn pending_retries(&self) -> usize {
        lock(&self.queue).retry_len()
    }

    pub async fn status(&self) -> Status {
        let registry = self.registry.lock().await;
        let queue = lock(&self.queue);
        Status {
            clients: registry.clients.len(),
            servers: registry.servers.len(),
            in_flight: registry.clients.values().map(|c| c.in_flight.len()).sum(),
            retry_queue: queue.retry_len(),
            active_files: queue.active_files(),
            unopened_files: queue.unopened_files(),
            pending_files: *self.pending_files.borrow(),
            objects_processed: lock(&self.progress).processed,
        }
    }

    /// Start output writers and publish file state changes
    fn settle(&self, settled: Settled) {
        if settled.is_empty() {
            return;
        }

        {
            let mut dumps = lock(&self.dumps);
            for job in settled.dumps {
                dumps.push(tokio::task::spawn_blocking(move || match job.run() {
                    Ok(count) => info!(
                        "wrote {} objects of file No. {} to {}",
                        count,
                        job.file_id,
                        job.paths.output.display()
                    ),
                    Err(e) => error!(
                        "file No. {}: writing {} failed ({}); log {} is kept",
                        job.file_id,
                        job.paths.output.display(),
                        e,
                        job.paths.log.display()
                    ),
                }));
            }
        }

        let files = lock(&self.files);
        let finished = settled
            .done
            .into_iter()
            .map(|id| (id, FileStatus::Done))
            .chain(settled.failed.into_iter().map(|(id, e)| (id, FileStatus::Failed(e))));
        for (id, state) in finished {
            if let Some(status) = files.get(&id) {
                if *status.borrow() == FileStatus::Pending {
                    status.send_replace(state);
                    self.pending_files.send_modify(|n| *n = n.saturating_sub(1));
                }
            }
        }
    }

    // ===== Peer cleanup =====

    async fn handle_death(&self, death: PeerDeath) {
        match (death.natural, &death.last_error) {
            (true, _) => info!("{} No. {}: shut down", death.kind, death.id),
            (false, Some(e)) => warn!("{} No. {}: presumed dead ({})", death.kind, death.id, e),
            (false, None) => warn!("{} No. {}: presumed dead", death.kind, death.id),
        }
        match death.kind {
            PeerKind::Client => {
                let mut registry = self.registry.lock().await;
                self.drop_client(&mut registry, death.id);
            }
            PeerKind::Server => self.drop_server(death.id).await,
        }
    }

    /// Unregister a client and requeue everything it held
    fn drop_client(&self, registry: &mut Registry, client_id: u32) {
        registry.unassign(client_id);
        let record = match registry.clients.remove(&client_id) {
            Some(record) => record,
            None => return,
        };
        if let Some(task) = record.keep_alive {
            task.abort();
        }
        if !record.in_flight.is_empty() {
            info!(
                "client No. {}: requeueing {} unfinished objects",
                client_id,
                record.in_flight.len()
            );
            lock(&self.queue).requeue(record.in_flight.into_values().collect());
        }
    }

    /// Unregister a server and kill or notify its clients
    async fn drop_server(&self, server_id: u32) {
        let mut registry = self.registry.lock().await;
        let record = match registry.remove_server(server_id) {
            Some(record) => record,
            None => return,
        };
        if let Some(task) = &record.keep_alive {
            task.abort();
        }

        let kill = self.config.coordinator.server_death_kill_clients;
        let mut clients: Vec<u32> = record.clients.iter().copied().collect();
        clients.sort_unstable();
        for client_id in clients {
            let peer = match registry.clients.get_mut(&client_id) {
                Some(client) => {
                    client.server_id = None;
                    client.peer.clone()
                }
                None => continue,
            };
            if kill {
                if let Err(e) = self.bounded(peer.die(true)).await {
                    warn!("client No. {}: die call failed ({})", client_id, e);
                }
                self.drop_client(&mut registry, client_id);
            } else if let Err(e) = self.bounded(peer.server_down(server_id)).await {
                warn!(
                    "client No. {}: could not report death of server No. {} ({})",
                    client_id, server_id, e
                );
            }
        }
    }

    /// Re-read a server's declared capacity and assignment policy
    async fn refresh_server(&self, server: &ServerHandle) -> CallResult<(u32, bool)> {
        let declared = self.bounded(server.max_clients()).await?;
        let by_request = self.bounded(server.accept_only_by_request()).await?;
        let capacity = effective_capacity(declared).ok_or_else(|| {
            SwitchboardError::registration(format!("illegal value for max clients: {}", declared))
        })?;
        Ok((capacity, by_request))
    }

    fn record_progress(&self, num_clients: usize) {
        let mut progress = lock(&self.progress);
        progress.processed += 1;
        let elapsed = progress.started.map(|s| s.elapsed()).unwrap_or_default();
        info!(
            "elapsed for {} objs./{} client{}: {}; avg. processing time: {} ({} objs/s)",
            progress.processed,
            num_clients,
            if num_clients == 1 { "" } else { "s" },
            format_duration(elapsed),
            format_duration(average_per_object(elapsed, progress.processed)),
            format_rate(calculate_rate(progress.processed, elapsed))
        );
    }
}

/// Receive death reports and clean up after the dead peers
async fn supervise(switchboard: Weak<Switchboard>, mut deaths: mpsc::UnboundedReceiver<PeerDeath>) {
    while let Some(death) = deaths.recv().await {
        match switchboard.upgrade() {
            Some(switchboard) => switchboard.handle_death(death).await,
            None => break,
        }
    }
}

#[async_trait]
impl SwitchboardApi for Switchboard {
    async fn register_client(&self, client: Arc<dyn ClientPeer>) -> CallResult<u32> {
        let host = self
            .bounded(client.host())
            .await
            .map_err(|e| SwitchboardError::registration(format!("host call failed: {}", e)))?;

        let mut registry = self.registry.lock().await;
        let id = registry.next_client_id();
        let keep_alive = self.keep_alive().spawn(
            PeerKind::Client,
            id,
            PeerHandle::Client(client.clone()),
            self.deaths.clone(),
        );
        registry.insert_client(ClientRecord {
            id,
            host: host.clone(),
            peer: client,
            server_id: None,
            in_flight: HashMap::new(),
            keep_alive: Some(keep_alive),
        });

        info!("client No. {}: registered from {}", id, host);
        Ok(id)
    }

    async fn register_server(&self, server: ServerHandle) -> CallResult<u32> {
        let describe = async {
            let host = self.bounded(server.host()).await?;
            let declared = self.bounded(server.max_clients()).await?;
            let by_request = self.bounded(server.accept_only_by_request()).await?;
            Ok::<_, SwitchboardError>((host, declared, by_request))
        };
        let (host, declared, by_request) = describe.await.map_err(|e| {
            SwitchboardError::registration(format!("problem invoking a server method: {}", e))
        })?;
        let max_clients = effective_capacity(declared).ok_or_else(|| {
            SwitchboardError::registration(format!("illegal value for max clients: {}", declared))
        })?;

        let mut registry = self.registry.lock().await;
        let id = registry.next_server_id();
        let keep_alive = self.keep_alive().spawn(
            PeerKind::Server,
            id,
            PeerHandle::Server(server.clone()),
            self.deaths.clone(),
        );
        registry.insert_server(ServerRecord {
            id,
            host: host.clone(),
            peer: server,
            max_clients,
            accept_only_by_request: by_request,
            clients: HashSet::new(),
            keep_alive: Some(keep_alive),
        });

        info!(
            "server No. {}: registered from {} (max clients {}{})",
            id,
            host,
            max_clients,
            if by_request { ", by request only" } else { "" }
        );
        Ok(id)
    }

    async fn get_server(&self, client_id: u32) -> CallResult<Option<ServerHandle>> {
        let mut registry = self.registry.lock().await;
        if !registry.clients.contains_key(&client_id) {
            return Err(SwitchboardError::UnrecognizedClient(client_id));
        }

        for server_id in registry.servers_by_load() {
            let (full, peer) = match registry.servers.get(&server_id) {
                Some(server) => (server.is_full(), server.peer.clone()),
                None => continue,
            };
            // Nothing lighter is left once a full server is reached
            if full {
                break;
            }

            match self.refresh_server(&peer).await {
                Ok((max_clients, by_request)) => {
                    registry.update_server(server_id, |s| {
                        s.max_clients = max_clients;
                        s.accept_only_by_request = by_request;
                    });
                }
                Err(e) => {
                    warn!("server No. {}: could not refresh capacity ({}); skipping", server_id, e);
                    continue;
                }
            }

            let eligible = registry
                .servers
                .get(&server_id)
                .map_or(false, |s| !s.accept_only_by_request && !s.is_full());
            if eligible {
                registry.assign(client_id, server_id);
                debug!("client No. {}: assigned to server No. {}", client_id, server_id);
                return Ok(Some(peer));
            }
        }

        debug!("client No. {}: no server available", client_id);
        Ok(None)
    }

    async fn get_server_by_id(
        &self,
        client_id: u32,
        server_id: u32,
    ) -> CallResult<Option<ServerHandle>> {
        let mut registry = self.registry.lock().await;
        if !registry.clients.contains_key(&client_id) {
            return Err(SwitchboardError::UnrecognizedClient(client_id));
        }
        let peer = match registry.servers.get(&server_id) {
            Some(server) => server.peer.clone(),
            None => return Err(SwitchboardError::UnrecognizedServer(server_id)),
        };

        match self.refresh_server(&peer).await {
            Ok((max_clients, by_request)) => {
                registry.update_server(server_id, |s| {
                    s.max_clients = max_clients;
                    s.accept_only_by_request = by_request;
                });
            }
            Err(e) => warn!("server No. {}: could not refresh capacity ({})", server_id, e),
        }

        let already_assigned = registry
            .clients
            .get(&client_id)
            .map_or(false, |c| c.server_id == Some(server_id));
        let full = registry.servers.get(&server_id).map_or(true, |s| s.is_full());
        if full && !already_assigned {
            return Ok(None);
        }
        registry.assign(client_id, server_id);
        debug!("client No. {}: assigned to requested server No. {}", client_id, server_id);
        Ok(Some(peer))
    }

    async fn next_object(&self, client_id: u32) -> CallResult<Option<WorkItem>> {
        let mut registry = self.registry.lock().await;
        let client = registry
            .clients
            .get_mut(&client_id)
            .ok_or(SwitchboardError::UnrecognizedClient(client_id))?;

        let (item, settled) = lock(&self.queue).next_item();
        if let Some(item) = &item {
            client.in_flight.insert(item.id(), item.clone());
            let mut progress = lock(&self.progress);
            if progress.started.is_none() {
                progress.started = Some(Instant::now());
            }
            debug!("client No. {}: handed object {}", client_id, item.id());
        }
        drop(registry);

        self.settle(settled);
        Ok(item)
    }

    async fn put_object(
        &self,
        client_id: u32,
        item: WorkItem,
        elapsed_millis: u64,
    ) -> CallResult<()> {
        let mut registry = self.registry.lock().await;
        let client = registry
            .clients
            .get_mut(&client_id)
            .ok_or(SwitchboardError::UnrecognizedClient(client_id))?;

        if client.in_flight.remove(&item.id()).is_none() {
            let message = format!(
                "client No. {} not known to be processing object {}",
                client_id,
                item.id()
            );
            warn!("putObject: {}", message);
            return Err(SwitchboardError::protocol(message));
        }
        let num_clients = registry.clients.len();

        let (result, settled) = lock(&self.queue).complete(&item);
        drop(registry);
        self.settle(settled);
        result?;

        debug!(
            "client No. {}: processed object {} in {}",
            client_id,
            item.id(),
            format_duration(Duration::from_millis(elapsed_millis))
        );
        self.record_progress(num_clients);
        Ok(())
    }

    async fn get_setting(&self, name: &str) -> CallResult<Option<String>> {
        Ok(self.settings.get(name).cloned())
    }

    async fn get_settings(&self) -> CallResult<BTreeMap<String, String>> {
        Ok(self.settings.clone())
    }

    async fn keep_alive_interval(&self) -> CallResult<Duration> {
        Ok(self.config.coordinator.keep_alive_interval())
    }

    async fn keep_alive_max_retries(&self) -> CallResult<u32> {
        Ok(self.config.coordinator.keep_alive_max_retries)
    }
}
