//! The embedded per-peer scheduling engine.
//!
//! Each engine runs one pod at a time through filter → score → permit →
//! bind against this peer's share of the node inventory. Engines are
//! pre-built and pooled; the dispatcher installs the pod in the engine's
//! slot, runs `schedule_one`, and reclaims the engine as soon as it
//! signals; binding continues in the background.

mod binder;
mod scorer;

pub use binder::{Binder, LogBinder};
pub use scorer::{NodeResources, Scorer, ScoringWeights};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio_util::sync::CancellationToken;

use crate::cluster::NodeInventory;
use crate::dispatch::DoneSignal;
use crate::permit::{PermitDecision, PermitPlugin};
use crate::proto::PodSpec;

/// This peer's view of the nodes it owns, refreshed from the inventory
/// whenever the partition changes.
#[derive(Debug, Default)]
pub struct NodeCache {
    nodes: RwLock<HashMap<String, NodeResources>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, nodes: Vec<NodeResources>) {
        let mut map = self.nodes.write().unwrap();
        map.clear();
        for node in nodes {
            map.insert(node.name.clone(), node);
        }
    }

    pub fn snapshot(&self) -> Vec<NodeResources> {
        self.nodes.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().unwrap().is_empty()
    }
}

/// Keep `cache` in sync with the nodes labeled for `group`.
pub async fn run_cache_sync(
    cache: Arc<NodeCache>,
    inventory: Arc<dyn NodeInventory>,
    group: String,
    cancel: CancellationToken,
) {
    let mut epochs = inventory.watch();
    loop {
        let owned = inventory.owned_resources(&group).await;
        tracing::debug!(group = %group, nodes = owned.len(), "node cache refreshed");
        cache.replace(owned);

        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = epochs.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// How one `schedule_one` invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Permit granted; binding was handed off to the background.
    Binding { node: String },
    /// Permit denied: some other peer owns the winning node.
    Rejected,
    /// No feasible node in this partition; a zero score was reported.
    Unschedulable,
    /// The slot was empty.
    NoPod,
}

pub struct Engine {
    nodes: Arc<NodeCache>,
    scorer: Scorer,
    permit: Arc<dyn PermitPlugin>,
    binder: Arc<dyn Binder>,
    next_pod: Mutex<Option<PodSpec>>,
}

impl Engine {
    pub fn new(
        nodes: Arc<NodeCache>,
        scorer: Scorer,
        permit: Arc<dyn PermitPlugin>,
        binder: Arc<dyn Binder>,
    ) -> Self {
        Self {
            nodes,
            scorer,
            permit,
            binder,
            next_pod: Mutex::new(None),
        }
    }

    /// Install the next pod. The slot must be empty: an engine is owned by
    /// exactly one dispatch between pop and push.
    pub fn install(&self, pod: PodSpec) {
        let mut slot = self.next_pod.lock().unwrap();
        debug_assert!(slot.is_none(), "engine slot already occupied");
        *slot = Some(pod);
    }

    /// Run one scheduling cycle for the installed pod. `done` is signaled
    /// at the permit stage (before the aggregator round trip), on the
    /// pre-permit failure path, and by the dispatcher when this returns.
    /// Any one release is enough for the dispatcher to reclaim the engine.
    pub async fn schedule_one(&self, done: &DoneSignal) -> ScheduleOutcome {
        let Some(pod) = self.next_pod.lock().unwrap().take() else {
            tracing::warn!("schedule_one called with an empty pod slot");
            return ScheduleOutcome::NoPod;
        };

        let nodes = self.nodes.snapshot();
        let scores = self.scorer.score_nodes(&nodes, &pod);
        let Some(best) = scores.iter().max_by_key(|s| s.score) else {
            // Failed before the permit stage: unblock the dispatcher and
            // make sure the aggregator for this key is not left waiting on
            // our score.
            tracing::debug!(
                pod = %pod.name,
                namespace = %pod.namespace,
                nodes = nodes.len(),
                "no feasible node in partition"
            );
            done.notify();
            self.permit.report_failure(&pod).await;
            return ScheduleOutcome::Unschedulable;
        };
        let node = best.node_name.clone();

        match self.permit.permit(done, &pod, &node, &scores).await {
            PermitDecision::Approved => {
                let binder = self.binder.clone();
                let bind_pod = pod.clone();
                let bind_node = node.clone();
                tokio::spawn(async move {
                    if let Err(err) = binder.bind(&bind_pod, &bind_node).await {
                        tracing::warn!(
                            pod = %bind_pod.name,
                            namespace = %bind_pod.namespace,
                            node = %bind_node,
                            error = %err,
                            "binding failed"
                        );
                    }
                });
                ScheduleOutcome::Binding { node }
            }
            PermitDecision::Rejected => ScheduleOutcome::Rejected,
            PermitDecision::Error(reason) => {
                tracing::warn!(
                    pod = %pod.name,
                    namespace = %pod.namespace,
                    node = %node,
                    reason,
                    "permit stage errored"
                );
                ScheduleOutcome::Rejected
            }
        }
    }
}
