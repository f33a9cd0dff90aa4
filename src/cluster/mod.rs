//! Boundaries to the cluster API.
//!
//! The scheduler core only ever touches the cluster through these traits:
//! node inventory + partition-label patches (leader), the webhook endpoint
//! record (leader), the unscheduled-pod feed (leader, watch mode), and pod
//! binding. [`MemoryCluster`] is the stock implementation backing solo
//! runs, demos, and the integration harness; production deployments plug
//! adapters for their control plane behind the same traits.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::config::PARTITION_LABEL;
use crate::engine::{Binder, NodeResources};
use crate::error::{Result, SchedError};
use crate::proto::PodSpec;

/// Node metadata as the partitioner sees it: just the name and the current
/// partition label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMeta {
    pub name: String,
    pub group: Option<String>,
}

/// Metadata-only view of the node inventory plus the resource view each
/// peer needs for the nodes it owns.
#[async_trait]
pub trait NodeInventory: Send + Sync {
    async fn nodes(&self) -> Vec<NodeMeta>;
    async fn owned_resources(&self, group: &str) -> Vec<NodeResources>;
    /// Epoch channel bumped on any inventory or label change.
    fn watch(&self) -> watch::Receiver<u64>;
}

/// Applies the partition label to a single node.
#[async_trait]
pub trait LabelPatcher: Send + Sync {
    async fn set_group(&self, node: &str, group: &str) -> Result<()>;
}

/// Create/clear the endpoint record that points the admission webhook
/// service at the current leader.
#[async_trait]
pub trait EndpointRecords: Send + Sync {
    async fn publish_webhook(&self, ip: &str, port: u16) -> Result<()>;
    async fn clear_webhook(&self) -> Result<()>;
}

/// Stream of not-yet-scheduled pods, consumed by the leader in watch mode.
pub trait PodFeed: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<PodSpec>;
}

/// Seed format for `--nodes-file`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSeed {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub capacity_memory_bytes: u64,
    pub capacity_cpu_millis: u64,
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub pod_key: String,
    pub node: String,
    pub bound_by: String,
    pub bound_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ClusterState {
    nodes: HashMap<String, NodeRecord>,
    bindings: Vec<Binding>,
    bound_keys: HashSet<String>,
    webhook_record: Option<(String, u16)>,
}

#[derive(Debug, Clone)]
struct NodeRecord {
    labels: HashMap<String, String>,
    resources: NodeResources,
}

/// In-memory cluster state shared by every peer of a single-process
/// deployment (or test cluster).
pub struct MemoryCluster {
    state: Mutex<ClusterState>,
    epoch: watch::Sender<u64>,
    pods: broadcast::Sender<PodSpec>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        let (epoch, _) = watch::channel(0);
        let (pods, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(ClusterState::default()),
            epoch,
            pods,
        }
    }
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Load node seeds from a JSON file, keeping only nodes matched by the
    /// optional `key=value` selector.
    pub fn load_nodes(&self, path: &Path, selector: Option<&str>) -> Result<usize> {
        let raw = std::fs::read(path)?;
        let seeds: Vec<NodeSeed> =
            serde_json::from_slice(&raw).map_err(|source| SchedError::NodesFile {
                path: path.to_path_buf(),
                source,
            })?;
        let selector = parse_selector(selector)?;

        let mut added = 0;
        for seed in seeds {
            if let Some((key, value)) = &selector {
                if seed.labels.get(key) != Some(value) {
                    continue;
                }
            }
            self.add_node(seed);
            added += 1;
        }
        Ok(added)
    }

    pub fn add_node(&self, seed: NodeSeed) {
        let mut state = self.state.lock().unwrap();
        state.nodes.insert(
            seed.name.clone(),
            NodeRecord {
                labels: seed.labels,
                resources: NodeResources {
                    name: seed.name,
                    capacity_memory_bytes: seed.capacity_memory_bytes,
                    capacity_cpu_millis: seed.capacity_cpu_millis,
                    used_memory_bytes: 0,
                    used_cpu_millis: 0,
                    pod_count: 0,
                },
            },
        );
        drop(state);
        self.bump();
    }

    pub fn remove_node(&self, name: &str) {
        let removed = self.state.lock().unwrap().nodes.remove(name).is_some();
        if removed {
            self.bump();
        }
    }

    /// Deliver a pod to the unscheduled-pod feed.
    pub fn submit_pod(&self, pod: PodSpec) {
        let _ = self.pods.send(pod);
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.state.lock().unwrap().bindings.clone()
    }

    pub fn webhook_record(&self) -> Option<(String, u16)> {
        self.state.lock().unwrap().webhook_record.clone()
    }

    /// Current group label of each node, for assertions and the planner.
    pub fn group_counts(&self) -> HashMap<String, usize> {
        let state = self.state.lock().unwrap();
        let mut counts = HashMap::new();
        for record in state.nodes.values() {
            if let Some(group) = record.labels.get(PARTITION_LABEL) {
                *counts.entry(group.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    fn bump(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Record a binding, charging the pod's resources to the node. Binding
    /// the same pod key twice is an error, surfaced loudly: it means two
    /// peers both won a permit.
    pub fn record_binding(&self, pod: &PodSpec, node: &str, bound_by: &str) -> Result<()> {
        let key = pod.key();
        let mut state = self.state.lock().unwrap();
        if !state.bound_keys.insert(key.clone()) {
            return Err(SchedError::AlreadyBound(key));
        }
        if let Some(record) = state.nodes.get_mut(node) {
            let request = pod.resources.clone().unwrap_or_default();
            record.resources.used_memory_bytes += request.memory_bytes;
            record.resources.used_cpu_millis += request.cpu_millis;
            record.resources.pod_count += 1;
        }
        state.bindings.push(Binding {
            pod_key: key,
            node: node.to_string(),
            bound_by: bound_by.to_string(),
            bound_at: Utc::now(),
        });
        drop(state);
        self.bump();
        Ok(())
    }
}

#[async_trait]
impl NodeInventory for MemoryCluster {
    async fn nodes(&self) -> Vec<NodeMeta> {
        let state = self.state.lock().unwrap();
        let mut nodes: Vec<NodeMeta> = state
            .nodes
            .values()
            .map(|record| NodeMeta {
                name: record.resources.name.clone(),
                group: record.labels.get(PARTITION_LABEL).cloned(),
            })
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    async fn owned_resources(&self, group: &str) -> Vec<NodeResources> {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .values()
            .filter(|record| record.labels.get(PARTITION_LABEL).map(String::as_str) == Some(group))
            .map(|record| record.resources.clone())
            .collect()
    }

    fn watch(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }
}

#[async_trait]
impl LabelPatcher for MemoryCluster {
    async fn set_group(&self, node: &str, group: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| SchedError::Internal(format!("unknown node {node}")))?;
        record
            .labels
            .insert(PARTITION_LABEL.to_string(), group.to_string());
        drop(state);
        self.bump();
        Ok(())
    }
}

#[async_trait]
impl EndpointRecords for MemoryCluster {
    async fn publish_webhook(&self, ip: &str, port: u16) -> Result<()> {
        self.state.lock().unwrap().webhook_record = Some((ip.to_string(), port));
        Ok(())
    }

    async fn clear_webhook(&self) -> Result<()> {
        self.state.lock().unwrap().webhook_record = None;
        Ok(())
    }
}

impl PodFeed for MemoryCluster {
    fn subscribe(&self) -> broadcast::Receiver<PodSpec> {
        self.pods.subscribe()
    }
}

/// Binder that records bindings in the shared [`MemoryCluster`].
pub struct MemoryBinder {
    cluster: Arc<MemoryCluster>,
    peer_name: String,
}

impl MemoryBinder {
    pub fn new(cluster: Arc<MemoryCluster>, peer_name: impl Into<String>) -> Self {
        Self {
            cluster,
            peer_name: peer_name.into(),
        }
    }
}

#[async_trait]
impl Binder for MemoryBinder {
    async fn bind(&self, pod: &PodSpec, node: &str) -> Result<()> {
        self.cluster.record_binding(pod, node, &self.peer_name)
    }
}

fn parse_selector(selector: Option<&str>) -> Result<Option<(String, String)>> {
    match selector {
        None | Some("") => Ok(None),
        Some(raw) => match raw.split_once('=') {
            Some((key, value)) => Ok(Some((key.to_string(), value.to_string()))),
            None => Err(SchedError::Config(format!(
                "node selector must be key=value, got {raw:?}"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(name: &str) -> NodeSeed {
        NodeSeed {
            name: name.to_string(),
            labels: HashMap::new(),
            capacity_memory_bytes: 16 << 30,
            capacity_cpu_millis: 8000,
        }
    }

    #[tokio::test]
    async fn labels_partition_the_inventory() {
        let cluster = MemoryCluster::new();
        cluster.add_node(seed("node-a"));
        cluster.add_node(seed("node-b"));

        cluster.set_group("node-a", "swarm-sched-0").await.unwrap();
        cluster.set_group("node-b", "swarm-sched-1").await.unwrap();

        let owned = cluster.owned_resources("swarm-sched-0").await;
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].name, "node-a");

        let nodes = cluster.nodes().await;
        assert_eq!(nodes[0].group.as_deref(), Some("swarm-sched-0"));
    }

    #[tokio::test]
    async fn double_binding_is_rejected() {
        let cluster = MemoryCluster::new();
        cluster.add_node(seed("node-a"));
        let pod = PodSpec {
            name: "p".into(),
            namespace: "default".into(),
            ..Default::default()
        };

        cluster.record_binding(&pod, "node-a", "peer-1").unwrap();
        let err = cluster.record_binding(&pod, "node-a", "peer-2");
        assert!(matches!(err, Err(SchedError::AlreadyBound(_))));
        assert_eq!(cluster.bindings().len(), 1);
    }

    #[tokio::test]
    async fn binding_charges_node_resources() {
        let cluster = MemoryCluster::new();
        cluster.add_node(seed("node-a"));
        cluster.set_group("node-a", "g").await.unwrap();

        let pod = PodSpec {
            name: "p".into(),
            namespace: "default".into(),
            resources: Some(crate::proto::ResourceRequest {
                memory_bytes: 1 << 30,
                cpu_millis: 250,
            }),
            ..Default::default()
        };
        cluster.record_binding(&pod, "node-a", "peer-1").unwrap();

        let owned = cluster.owned_resources("g").await;
        assert_eq!(owned[0].used_memory_bytes, 1 << 30);
        assert_eq!(owned[0].used_cpu_millis, 250);
        assert_eq!(owned[0].pod_count, 1);
    }

    #[test]
    fn selector_parsing() {
        assert_eq!(parse_selector(None).unwrap(), None);
        assert_eq!(
            parse_selector(Some("zone=a")).unwrap(),
            Some(("zone".to_string(), "a".to_string()))
        );
        assert!(parse_selector(Some("nonsense")).is_err());
    }
}
