//! NCL agent.
//!
//! Runs a compute node connection or an orchestrator against a NATS server.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use ncl_agent::{
    parse_labels, FileCheckpointer, InMemoryNodeManager, LoggingMessageHandler,
    NoopLogStreamServer, PassthroughMessageCreator, StaticNodeInfoProvider,
};
use nclprotocol::bus::NatsClientFactory;
use nclprotocol::compute::{self, ConnectionManager};
use nclprotocol::models::{BuildVersionInfo, ComputeNodeInfo, NodeInfo, NodeType, Resources};
use nclprotocol::orchestrator::{self, ComputeManager};
use nclprotocol::watcher::InMemoryEventStore;
use nclprotocol_telemetry::{log_shutdown, log_startup, LogFormat, Telemetry, TelemetryConfig};

/// Upper bound on graceful shutdown after Ctrl-C.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "ncl-agent", about = "NCL transport agent", version)]
struct Cli {
    /// NATS server URL.
    #[arg(long, env = "NCL_NATS_URL", default_value = "nats://127.0.0.1:4222", global = true)]
    nats_url: String,

    /// Log level.
    #[arg(long, env = "NCL_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Log format (json or pretty).
    #[arg(long, env = "NCL_LOG_FORMAT", default_value = "json", global = true)]
    log_format: String,

    /// Print Prometheus metrics to stdout on shutdown.
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect a compute node to an orchestrator.
    Compute(ComputeArgs),

    /// Serve compute nodes.
    Orchestrator(OrchestratorArgs),
}

#[derive(Args, Debug)]
struct ComputeArgs {
    /// Node identifier.
    #[arg(long, env = "NCL_NODE_ID")]
    node_id: String,

    /// File holding the node's checkpoints.
    #[arg(long, default_value = "ncl-checkpoints.json")]
    checkpoint_file: String,

    /// Node label as key=value (repeatable).
    #[arg(long = "label")]
    labels: Vec<String>,

    /// CPU cores offered.
    #[arg(long, default_value = "1")]
    cpu: f64,

    /// Memory offered, in bytes.
    #[arg(long, default_value = "1073741824")]
    memory: u64,

    /// Disk offered, in bytes.
    #[arg(long, default_value = "10737418240")]
    disk: u64,

    /// Heartbeat interval in seconds.
    #[arg(long, default_value = "15")]
    heartbeat_interval: u64,

    /// Missed heartbeat intervals before reconnecting.
    #[arg(long, default_value = "5")]
    heartbeat_miss_factor: u32,

    /// Node info update interval in seconds.
    #[arg(long, default_value = "60")]
    node_info_update_interval: u64,

    /// Control request timeout in seconds.
    #[arg(long, default_value = "10")]
    request_timeout: u64,

    /// Connection check interval in seconds.
    #[arg(long, default_value = "10")]
    reconnect_interval: u64,
}

#[derive(Args, Debug)]
struct OrchestratorArgs {
    /// Seconds without a heartbeat before a node is considered disconnected.
    #[arg(long, default_value = "75")]
    heartbeat_timeout: u64,

    /// Seconds between stale node sweeps.
    #[arg(long, default_value = "15")]
    sweep_interval: u64,

    /// Seconds allowed for stopping one node's data plane.
    #[arg(long, default_value = "5")]
    data_plane_stop_timeout: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let log_format: LogFormat = cli.log_format.parse()?;
    let mut telemetry_config = TelemetryConfig::new()
        .with_service_name("ncl-agent")
        .with_log_level(&cli.log_level)
        .with_log_format(log_format);
    if let Commands::Compute(args) = &cli.command {
        telemetry_config = telemetry_config.with_node_id(&args.node_id);
    }
    let telemetry = Telemetry::init(telemetry_config).context("failed to initialize telemetry")?;
    let span = telemetry.config().root_span();

    match cli.command {
        Commands::Compute(args) => {
            run_compute(&cli.nats_url, args, &telemetry)
                .instrument(span)
                .await?
        }
        Commands::Orchestrator(args) => {
            run_orchestrator(&cli.nats_url, args, &telemetry)
                .instrument(span)
                .await?
        }
    }

    if cli.print_metrics {
        print!("{}", telemetry.render_prometheus()?);
    }
    Ok(())
}

async fn run_compute(nats_url: &str, args: ComputeArgs, telemetry: &Telemetry) -> anyhow::Result<()> {
    let capacity = Resources {
        cpu: args.cpu,
        memory: args.memory,
        disk: args.disk,
        ..Default::default()
    };
    let info = NodeInfo {
        node_id: args.node_id.clone(),
        node_type: NodeType::Compute,
        labels: parse_labels(&args.labels)?,
        supported_protocols: vec!["ncl/v1".to_string()],
        version: BuildVersionInfo {
            git_version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        },
        compute_node_info: ComputeNodeInfo {
            max_capacity: capacity.clone(),
            max_job_requirements: capacity.clone(),
            available_capacity: capacity,
            ..Default::default()
        },
    };

    let config = compute::Config::new(&args.node_id)
        .with_heartbeat_interval(Duration::from_secs(args.heartbeat_interval))
        .with_heartbeat_miss_factor(args.heartbeat_miss_factor)
        .with_node_info_update_interval(Duration::from_secs(args.node_info_update_interval))
        .with_request_timeout(Duration::from_secs(args.request_timeout))
        .with_reconnect_interval(Duration::from_secs(args.reconnect_interval));
    config.validate().context("invalid compute configuration")?;

    let checkpointer = FileCheckpointer::open(&args.checkpoint_file)
        .await
        .context("failed to open checkpoint file")?;
    let deps = compute::Dependencies {
        client_factory: Arc::new(NatsClientFactory::new(
            nats_url,
            format!("ncl-compute-{}", args.node_id),
        )),
        node_info_provider: Arc::new(StaticNodeInfoProvider::new(info)),
        message_handler: Arc::new(LoggingMessageHandler::new("compute")),
        message_creator: Arc::new(PassthroughMessageCreator::new()),
        event_store: Arc::new(InMemoryEventStore::new()),
        checkpointer: Arc::new(checkpointer),
        log_stream_server: Arc::new(NoopLogStreamServer),
        metrics: None,
    }
    .with_metrics(telemetry.metrics_clone());

    let manager = ConnectionManager::new(config, deps)?;
    manager.on_state_change(Arc::new(|state: nclprotocol::ConnectionState| {
        tracing::debug!(state = %state, "observed connection state");
    }));
    manager.start().await?;
    log_startup!(node_id = %args.node_id, nats_url = %nats_url, role = "compute", "agent started");

    shutdown_signal().await;
    let ctx = shutdown_deadline();
    let result = manager.close(&ctx).await;
    log_shutdown!(node_id = %args.node_id, role = "compute", "agent stopped");
    result.context("failed to close connection")
}

async fn run_orchestrator(
    nats_url: &str,
    args: OrchestratorArgs,
    telemetry: &Telemetry,
) -> anyhow::Result<()> {
    let config = orchestrator::Config::new()
        .with_data_plane_stop_timeout(Duration::from_secs(args.data_plane_stop_timeout));
    config.validate().context("invalid orchestrator configuration")?;
    if args.sweep_interval == 0 {
        return Err(anyhow!("sweep interval must be positive"));
    }

    let node_manager = Arc::new(InMemoryNodeManager::new(Duration::from_secs(
        args.heartbeat_timeout,
    ))?);
    let deps = orchestrator::Dependencies {
        client_factory: Arc::new(NatsClientFactory::new(nats_url, "ncl-orchestrator")),
        node_manager: node_manager.clone(),
        message_handler: Arc::new(LoggingMessageHandler::new("orchestrator")),
        message_creator_factory: Arc::new(PassthroughMessageCreator::new()),
        event_store: Arc::new(InMemoryEventStore::new()),
        metrics: None,
    }
    .with_metrics(telemetry.metrics_clone());

    let manager = ComputeManager::new(config, deps)?;
    manager.start().await?;

    let sweep_cancel = CancellationToken::new();
    let sweep = {
        let node_manager = node_manager.clone();
        let cancel = sweep_cancel.clone();
        let interval = Duration::from_secs(args.sweep_interval);
        tokio::spawn(async move { node_manager.run_sweep(interval, cancel).await })
    };
    log_startup!(nats_url = %nats_url, role = "orchestrator", "agent started");

    shutdown_signal().await;
    sweep_cancel.cancel();
    let _ = sweep.await;
    let ctx = shutdown_deadline();
    let result = manager.stop(&ctx).await;
    log_shutdown!(
        role = "orchestrator",
        connected_nodes = node_manager.connected_count(),
        "agent stopped"
    );
    result.context("failed to stop compute manager")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}

/// Token cancelled once the shutdown timeout elapses.
fn shutdown_deadline() -> CancellationToken {
    let ctx = CancellationToken::new();
    let deadline = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
        deadline.cancel();
    });
    ctx
}
