//! TeaCluster - cluster membership daemon and tools
//!
//! Usage:
//!   teacluster [OPTIONS] <COMMAND>
//!
//! Commands:
//!   run                    Join the cluster and keep the membership view current
//!   peers                  Print the peers known to the node on this host
//!   reload [--all]         Reload templates on this node and all of its peers
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use teacluster::cluster::{restart_peers, ClusterCoordinator};
use teacluster::config::{ClusterConfig, Config};
use teacluster::net::{resolve_local_net, BoundTransport, SubnetSpec};
use teacluster::remote::{local_hostname, PeerHandle, PeerRef, ReloadHook, UNNAMED_CLUSTER};
use teacluster::rpc::{MembershipRegistry, RpcRuntime};
use teacluster::{ClusterError, CommandReloadHook};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// TeaCluster - cluster membership for template servers
#[derive(Parser, Debug)]
#[command(name = "teacluster")]
#[command(author = "TeaCluster Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Multicast gossip membership and peer invocation for template servers")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join the cluster and keep the membership view current until Ctrl+C
    Run,
    /// Print the peers known to the node running on this host
    Peers,
    /// Reload templates on this host's node and every peer it knows
    Reload {
        /// Reload every template instead of only changed ones
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults plus environment
    let file_config = match &args.config {
        Some(config_path) => Config::load(config_path),
        None => Config::from_env(),
    };
    let file_config = match file_config {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let Some(cluster_cfg) = file_config.cluster else {
        eprintln!("No [cluster] section configured; clustering is disabled");
        std::process::exit(1);
    };

    match args.command {
        Command::Run => run(cluster_cfg).await?,
        Command::Peers => peers(&cluster_cfg).await?,
        Command::Reload { all } => {
            if !reload(&cluster_cfg, all).await? {
                std::process::exit(2);
            }
        }
    }

    Ok(())
}

/// Daemon loop: announce, gossip, ping and reconcile until Ctrl+C
async fn run(cluster_cfg: ClusterConfig) -> Result<(), ClusterError> {
    let hook = cluster_cfg
        .reload_command
        .as_ref()
        .map(|cmd| Arc::new(CommandReloadHook::new(cmd.clone())) as Arc<dyn ReloadHook>);
    if hook.is_none() {
        warn!("No reload_command configured; reload requests will report an error");
    }

    let runtime = RpcRuntime::new();
    let Some(coordinator) =
        ClusterCoordinator::from_config(runtime.clone(), Some(&cluster_cfg), hook).await?
    else {
        eprintln!("Cluster section names neither a multicast group nor servers");
        std::process::exit(1);
    };

    info!("Starting TeaCluster node");
    info!("  Cluster: {}", coordinator.cluster_name());
    info!("  Server: {}", coordinator.server_name());
    info!("  Bound as: {}", coordinator.self_ref());
    info!("  Seeds: {:?}", coordinator.seeds());
    info!(
        "  Mode: {}",
        if cluster_cfg.active { "active" } else { "passive" }
    );

    // a passive node observes only and never announces itself
    if coordinator.launch_auto(cluster_cfg.active).await && cluster_cfg.active {
        if let Err(e) = coordinator.join_cluster().await {
            warn!("Failed to announce join: {}", e);
        }
    }

    let mut ping = tokio::time::interval(cluster_cfg.ping_interval);
    let mut reconcile = tokio::time::interval(cluster_cfg.reconcile_interval);

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if !coordinator.has_gossip() {
                    continue;
                }
                if !coordinator.is_auto_running() {
                    warn!("Gossip loop stopped; restarting it");
                    coordinator.launch_auto(cluster_cfg.active).await;
                }
                if !cluster_cfg.active {
                    continue;
                }
                if let Err(e) = coordinator.ping_cluster().await {
                    warn!("Failed to send ping: {}", e);
                }
            }
            _ = reconcile.tick() => {
                let names = coordinator.resolve_server_names().await;
                info!(
                    "Peers: {:?} (unresolved seeds: {:?})",
                    names,
                    coordinator.unresolved_seeds()
                );
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Shutting down");
                break;
            }
        }
    }

    coordinator.destroy().await;
    runtime.shutdown();
    Ok(())
}

/// Find the handle bound by the node running on this host
async fn local_node(cluster_cfg: &ClusterConfig) -> Result<(MembershipRegistry, PeerRef), ClusterError> {
    let runtime = RpcRuntime::new();
    let server_name = cluster_cfg
        .server_name
        .as_ref()
        .map(|name| name.to_lowercase())
        .unwrap_or_else(local_hostname);

    let host = match &cluster_cfg.local_net {
        Some(spec) => {
            let addr = resolve_local_net(&server_name, &spec.parse::<SubnetSpec>()?).await?;
            runtime.install_transport(BoundTransport::new(addr));
            addr.to_string()
        }
        None => server_name,
    };

    let registry = MembershipRegistry::new(runtime, cluster_cfg.rmi.port);
    let cluster_name = cluster_cfg.name.as_deref().unwrap_or(UNNAMED_CLUSTER);
    let node = registry.lookup(&host, cluster_name).await?;
    Ok((registry, node))
}

async fn peers(cluster_cfg: &ClusterConfig) -> Result<(), ClusterError> {
    let (registry, node) = local_node(cluster_cfg).await?;
    let stub = registry.stub(node);

    println!("{}\t{}", stub.server_name().await?, stub.peer_ref());
    for peer in stub.known_peers().await? {
        match registry.stub(peer.clone()).server_name().await {
            Ok(name) => println!("{}\t{}", name, peer),
            Err(e) => println!("?\t{}\t({})", peer, e),
        }
    }
    Ok(())
}

/// Returns whether every node reloaded cleanly
async fn reload(cluster_cfg: &ClusterConfig, all: bool) -> Result<bool, ClusterError> {
    let (registry, node) = local_node(cluster_cfg).await?;

    let mut targets = vec![node.clone()];
    targets.extend(registry.stub(node).known_peers().await?);

    let (report, _) = restart_peers(&registry, targets, all).await;
    for name in &report.reloaded {
        println!("reloaded {}", name);
    }
    for err in &report.errors {
        eprintln!("error: {}", err);
    }
    Ok(report.is_success())
}
