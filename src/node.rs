//! Composition root: wires one peer together and runs it.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::cluster::{EndpointRecords, LabelPatcher, NodeInventory, PodFeed};
use crate::config::{SCHEDULER_NAME, SchedulerConfig};
use crate::dispatch::DispatchCore;
use crate::election::LeaderState;
use crate::engine::{self, Binder, Engine, NodeCache, Scorer};
use crate::error::Result;
use crate::grpc::{self, PeerServer};
use crate::intake;
use crate::leader::LeaderActivities;
use crate::logging::Sampler;
use crate::membership::{EndpointEvent, MemberSet};
use crate::permit::RemotePermit;
use crate::proto::PodSpec;
use crate::relay::RelayPool;
use crate::score::ScoreBoard;

/// Boundary implementations this peer talks to the cluster through.
pub struct ClusterHandles {
    pub inventory: Arc<dyn NodeInventory>,
    pub patcher: Arc<dyn LabelPatcher>,
    pub records: Arc<dyn EndpointRecords>,
    pub pod_feed: Arc<dyn PodFeed>,
    pub binder: Arc<dyn Binder>,
}

/// Inbound channels feeding a running node: discovery events, leadership
/// transitions, and (webhook mode aside) direct pod submission.
pub struct NodeChannels {
    pub endpoint_events: mpsc::Sender<EndpointEvent>,
    pub pod_queue: mpsc::Sender<PodSpec>,
}

pub struct Node {
    pub config: SchedulerConfig,
    pub members: Arc<MemberSet>,
    pub scores: Arc<ScoreBoard>,
    pub dispatch: Arc<DispatchCore>,
    node_cache: Arc<NodeCache>,
    handles: ClusterHandles,
    sampler: Sampler,
    endpoint_events: mpsc::Receiver<EndpointEvent>,
    pod_queue_rx: mpsc::Receiver<PodSpec>,
    pod_queue_tx: mpsc::Sender<PodSpec>,
}

impl Node {
    pub fn new(config: SchedulerConfig, handles: ClusterHandles) -> (Self, NodeChannels) {
        let sampler = Sampler::new(config.log_sample_rate);
        let members = Arc::new(MemberSet::new(
            config.pod_name.clone(),
            config.fan_out,
            config.allow_solo,
        ));
        let scores = Arc::new(ScoreBoard::new(members.clone(), config.aggregation_deadline));

        let node_cache = Arc::new(NodeCache::new());
        let engines: Vec<Arc<Engine>> = if config.relay_only {
            Vec::new()
        } else {
            let permit = Arc::new(RemotePermit::new(
                members.clone(),
                config.peer_port,
                config.permit_always_deny,
            ));
            (0..config.num_engines)
                .map(|_| {
                    Arc::new(Engine::new(
                        node_cache.clone(),
                        Scorer::default(),
                        permit.clone(),
                        handles.binder.clone(),
                    ))
                })
                .collect()
        };

        let relay = RelayPool::new(config.peer_port, sampler);
        let dispatch = Arc::new(DispatchCore::new(
            engines,
            relay,
            members.clone(),
            config.relay_only,
            config.wait_for_subschedulers,
            config.subscheduler_wait,
            sampler,
        ));

        let (endpoint_tx, endpoint_rx) = mpsc::channel(256);
        let (pod_queue_tx, pod_queue_rx) = intake::pod_queue(config.queue_capacity);

        let channels = NodeChannels {
            endpoint_events: endpoint_tx,
            pod_queue: pod_queue_tx.clone(),
        };
        let node = Self {
            config,
            members,
            scores,
            dispatch,
            node_cache,
            handles,
            sampler,
            endpoint_events: endpoint_rx,
            pod_queue_rx,
            pod_queue_tx,
        };
        (node, channels)
    }

    /// Start every subsystem and run until `cancel` fires.
    ///
    /// Spawned pieces: the discovery ingest loop, the node-cache sync, the
    /// dispatch workers, leader activities, and (in webhook mode) the
    /// admission webhook. The peer gRPC server runs in the
    /// foreground; its failure to bind is fatal.
    pub async fn run(
        self,
        leader_states: watch::Receiver<LeaderState>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let Node {
            config,
            members,
            scores,
            dispatch,
            node_cache,
            handles,
            sampler,
            mut endpoint_events,
            pod_queue_rx,
            pod_queue_tx,
        } = self;

        // Discovery ingestion.
        {
            let members = members.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        event = endpoint_events.recv() => match event {
                            Some(event) => members.ingest(event),
                            None => return,
                        },
                    }
                }
            });
        }

        // Keep the engine's node view in sync with this peer's partition.
        if !config.relay_only {
            tokio::spawn(engine::run_cache_sync(
                node_cache,
                handles.inventory.clone(),
                config.pod_name.clone(),
                cancel.clone(),
            ));
        }

        dispatch.spawn_workers(pod_queue_rx, config.num_workers, cancel.clone());

        // Webhook intake runs everywhere; only the leader advertises it.
        if !config.watch_pods {
            let state = intake::webhook::WebhookState {
                queue: pod_queue_tx.clone(),
                scheduler_name: SCHEDULER_NAME.to_string(),
                sampler,
            };
            let tls = match &config.cert_dir {
                Some(dir) => Some(crate::tls::load_server_config(dir).await.map_err(|err| {
                    crate::error::SchedError::Config(format!("webhook TLS: {err}"))
                })?),
                None => None,
            };
            let addr = config.webhook_addr;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = intake::webhook::serve(addr, state, tls, cancel).await {
                    tracing::error!(error = %err, "webhook server failed");
                }
            });
        }

        if config.leader_eligible {
            let activities = LeaderActivities {
                members: members.clone(),
                inventory: handles.inventory.clone(),
                patcher: handles.patcher.clone(),
                records: handles.records.clone(),
                pod_feed: handles.pod_feed.clone(),
                pod_queue: pod_queue_tx,
                pod_ip: config.pod_ip.clone(),
                webhook_port: config.webhook_addr.port(),
                watch_pods: config.watch_pods,
                partition_interval: config.partition_interval,
                sampler,
            };
            tokio::spawn(activities.run(leader_states, cancel.clone()));
        } else {
            // Still track the leader for topology and scoring targets.
            let members = members.clone();
            let mut leader_states = leader_states;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    members.set_leader(leader_states.borrow_and_update().leader_name());
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        changed = leader_states.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }

        let server = PeerServer::new(dispatch, scores, sampler);
        grpc::serve(config.grpc_addr, server, cancel).await
    }
}
