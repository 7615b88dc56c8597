//! Switchboard CLI entry point

use anyhow::{Context, Result};
use log::{error, info, LevelFilter};
use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Duration;
use switchboard::config::cli::{Cli, ExecutionMode};
use switchboard::config::toml::load_config;
use switchboard::config::validator::validate_config;
use switchboard::distributed::{CoordinatorService, PeerEndpoint, RemoteSwitchboard};
use switchboard::fault::{Retry, RetryPolicy};
use switchboard::peer::{
    ClientOptions, ClientRunner, ExecProcessor, ExecService, PeerHandle, Processor, ServeProcessor,
    ServerOptions, ServerRunner, SwitchboardApi,
};
use switchboard::{Switchboard, SwitchboardConfig};

/// Listen address for peer endpoints when none is given
const PEER_LISTEN: &str = "0.0.0.0:0";

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    let config = load_config(&cli)?;
    validate_config(&config).context("Configuration validation failed")?;
    init_logging(&cli, &config)?;

    println!("Switchboard v{}", env!("CARGO_PKG_VERSION"));
    println!("Started {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    println!();

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    match cli.mode {
        ExecutionMode::Coordinator => runtime.block_on(run_coordinator(cli, config)),
        ExecutionMode::Client => runtime.block_on(run_client(cli, config)),
        ExecutionMode::Server => runtime.block_on(run_server(cli, config)),
    }
}

/// Log to stderr, or append to the messages file when one is configured
fn init_logging(cli: &Cli, config: &SwitchboardConfig) -> Result<()> {
    let level = if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).parse_default_env();

    if let Some(path) = &config.coordinator.messages_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open messages file: {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init().context("Failed to initialize logging")?;
    Ok(())
}

/// Accept peers, process every input file, then shut the peers down
async fn run_coordinator(cli: Cli, config: SwitchboardConfig) -> Result<()> {
    print!("{}", config);
    println!();

    let listener = CoordinatorService::bind(&config.coordinator.listen).await?;
    let switchboard = Switchboard::new(config);
    let service = Arc::new(CoordinatorService::new(switchboard.clone()));
    let accept_loop = tokio::spawn(service.run(listener));

    let mut file_ids = Vec::with_capacity(cli.inputs.len());
    for input in &cli.inputs {
        let id = switchboard
            .process_file(input.clone(), None, None)
            .with_context(|| format!("Failed to queue {}", input.display()))?;
        info!("queued {} as file No. {}", input.display(), id);
        file_ids.push((id, input));
    }

    let mut failures = 0;
    for (id, input) in file_ids {
        if let Err(e) = switchboard.wait_for_file(id).await {
            error!("{}: {}", input.display(), e);
            failures += 1;
        }
    }
    switchboard.cleanup_when_all_files_are_done().await;
    accept_loop.abort();

    let status = switchboard.status().await;
    println!();
    println!("Objects processed: {}", status.objects_processed);
    println!("Files failed: {}", failures);

    if failures > 0 {
        anyhow::bail!("{} of {} input files failed", failures, cli.inputs.len());
    }
    Ok(())
}

/// Switchboard handle for a peer process
///
/// Transient failures are retried per the client retry settings; the
/// runners decide what to do once those run out.
fn connect(cli: &Cli, config: &SwitchboardConfig) -> Arc<dyn SwitchboardApi> {
    let remote: Arc<dyn SwitchboardApi> = Arc::new(RemoteSwitchboard::new(
        cli.switchboard.clone(),
        config.coordinator.socket_timeout(),
    ));
    let policy = RetryPolicy::from_count(config.client.retries, config.client.retry_sleep());
    Arc::new(Retry::new(remote, policy))
}

async fn bind_endpoint(cli: &Cli) -> Result<(tokio::net::TcpListener, String)> {
    let listen = cli.listen.as_deref().unwrap_or(PEER_LISTEN);
    let (listener, endpoint) = PeerEndpoint::bind(listen, cli.advertise.as_deref()).await?;
    info!("peer endpoint listening on {} (advertised as {})", listen, endpoint);
    Ok((listener, endpoint))
}

/// Pull and process work items until the switchboard says to stop
async fn run_client(cli: Cli, config: SwitchboardConfig) -> Result<()> {
    match cli.exec.clone() {
        Some(command) => client_loop(cli, config, ExecProcessor::new(command)).await,
        None => client_loop(cli, config, ServeProcessor).await,
    }
}

async fn client_loop<P: Processor + 'static>(
    cli: Cli,
    config: SwitchboardConfig,
    processor: P,
) -> Result<()> {
    let (listener, endpoint) = bind_endpoint(&cli).await?;
    let options = ClientOptions {
        endpoint: Some(endpoint),
        retry: RetryPolicy::from_count(config.client.retries, config.client.retry_sleep()),
        failover: config.client.failover,
        next_object_interval: config.client.next_object_interval(),
        server_id: cli.server_id,
        ..ClientOptions::default()
    };

    let runner = ClientRunner::new(connect(&cli, &config), processor, options);
    let peer = PeerEndpoint::new(
        PeerHandle::Client(runner.client().clone()),
        config.coordinator.socket_timeout(),
    );
    let endpoint_task = tokio::spawn(Arc::new(peer).run(listener));

    let result = async {
        runner.start().await?;
        runner.process_objects_then_die().await
    }
    .await;
    endpoint_task.abort();

    let processed = result.context("Client failed")?;
    println!("Objects processed: {}", processed);
    Ok(())
}

/// Serve assigned clients until the switchboard says to stop
async fn run_server(cli: Cli, config: SwitchboardConfig) -> Result<()> {
    let command = cli
        .exec
        .clone()
        .context("Server mode requires --exec <COMMAND>")?;
    let (listener, endpoint) = bind_endpoint(&cli).await?;
    let options = ServerOptions {
        endpoint: Some(endpoint),
        max_clients: cli.max_clients,
        accept_only_by_request: cli.accept_only_by_request,
        retry_sleep: config.client.retry_sleep(),
        ..ServerOptions::default()
    };

    let runner = ServerRunner::new(connect(&cli, &config), ExecService::new(command), options);
    let peer = PeerEndpoint::new(
        PeerHandle::Server(runner.server().clone()),
        config.coordinator.socket_timeout(),
    );
    let endpoint_task = tokio::spawn(Arc::new(peer).run(listener));

    let result = runner.run().await;
    // let the final die reply leave before the endpoint goes away
    tokio::time::sleep(Duration::from_millis(100)).await;
    endpoint_task.abort();

    let id = result.context("Server failed")?;
    println!("Server No. {} shut down", id);
    Ok(())
}
