use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use swarm_sched::cluster::{MemoryBinder, MemoryCluster};
use swarm_sched::config::{
    SchedulerConfig, DEFAULT_FAN_OUT, DEFAULT_NUM_ENGINES, DEFAULT_NUM_WORKERS,
};
use swarm_sched::election;
use swarm_sched::membership::{Endpoint, EndpointEvent, EndpointSlice};
use swarm_sched::node::{ClusterHandles, Node};
use swarm_sched::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "swarm-sched")]
#[command(about = "Horizontally-scaled pod scheduler peer")]
struct Args {
    /// gRPC server address for peer traffic
    #[arg(long, default_value = "0.0.0.0:50051")]
    grpc_addr: SocketAddr,

    /// Admission webhook address
    #[arg(long, default_value = "0.0.0.0:8443")]
    webhook_addr: SocketAddr,

    /// Number of concurrent dispatch workers
    #[arg(long, default_value_t = DEFAULT_NUM_WORKERS)]
    num_workers: usize,

    /// Number of pre-built scheduling engines in the pool
    #[arg(long, default_value_t = DEFAULT_NUM_ENGINES)]
    num_engines: usize,

    /// Relay tree branching factor
    #[arg(long, default_value_t = DEFAULT_FAN_OUT)]
    fan_out: usize,

    /// Fraction of sub-scheduler acknowledgements to wait for
    #[arg(long, default_value_t = 1.0)]
    wait_for_subschedulers: f64,

    /// Whether this peer takes part in leader activities
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    leader_eligible: bool,

    /// Only relay pods, never schedule locally
    #[arg(long)]
    relay_only: bool,

    /// Leader watches for unscheduled pods instead of using the webhook
    #[arg(long)]
    watch_pods: bool,

    /// Deny every permit. For testing only
    #[arg(long)]
    permit_always_deny: bool,

    /// Only track nodes matching this key=value selector (leader only)
    #[arg(long)]
    node_selector: Option<String>,

    /// Peer endpoints as name=host pairs, comma-separated
    /// (e.g. "swarm-sched-0=10.0.0.1,swarm-sched-relay-0=10.0.0.2")
    #[arg(long, default_value = "")]
    peers: String,

    /// Pod name of the fixed leader (defaults to leaderless)
    #[arg(long)]
    leader: Option<String>,

    /// JSON file seeding the in-memory node inventory
    #[arg(long)]
    nodes_file: Option<PathBuf>,

    /// Directory with tls.crt/tls.key for the webhook
    #[arg(long)]
    cert_dir: Option<PathBuf>,
}

fn parse_peers(raw: &str) -> Vec<Endpoint> {
    raw.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .filter_map(|entry| match entry.trim().split_once('=') {
            Some((name, host)) => Some(Endpoint::new(name, host)),
            None => {
                tracing::warn!(entry, "invalid peer entry, expected name=host");
                None
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = SchedulerConfig {
        grpc_addr: args.grpc_addr,
        webhook_addr: args.webhook_addr,
        num_workers: args.num_workers,
        num_engines: args.num_engines,
        fan_out: args.fan_out,
        wait_for_subschedulers: args.wait_for_subschedulers,
        leader_eligible: args.leader_eligible,
        relay_only: args.relay_only,
        watch_pods: args.watch_pods,
        permit_always_deny: args.permit_always_deny,
        node_selector: args.node_selector,
        cert_dir: args.cert_dir,
        ..SchedulerConfig::default()
    };
    config.apply_env()?;
    config.validate()?;

    tracing::info!(
        pod = %config.pod_name,
        grpc_addr = %config.grpc_addr,
        relay_only = config.relay_only,
        watch_pods = config.watch_pods,
        allow_solo = config.allow_solo,
        "starting scheduler peer"
    );

    let cluster = MemoryCluster::new();
    if let Some(path) = &args.nodes_file {
        let added = cluster.load_nodes(path, config.node_selector.as_deref())?;
        tracing::info!(nodes = added, "seeded node inventory");
    }

    let binder = Arc::new(MemoryBinder::new(cluster.clone(), config.pod_name.clone()));
    let handles = ClusterHandles {
        inventory: cluster.clone(),
        patcher: cluster.clone(),
        records: cluster.clone(),
        pod_feed: cluster.clone(),
        binder,
    };

    let (node, channels) = Node::new(config, handles);

    // Static discovery: the configured peer list is the membership.
    let peers = parse_peers(&args.peers);
    if !peers.is_empty() {
        channels
            .endpoint_events
            .send(EndpointEvent::Applied(EndpointSlice {
                name: "swarm-sched-static".to_string(),
                generation: 1,
                endpoints: peers,
            }))
            .await
            .ok();
    }

    let (_leader_tx, leader_rx) = election::static_leader(args.leader.as_deref());

    let cancel = install_shutdown_handler();
    node.run(leader_rx, cancel).await?;
    Ok(())
}
