//! Reactions to leadership transitions.
//!
//! Whoever holds the lease runs the node partitioner, optionally the pod
//! watcher, and advertises the webhook endpoint at its own address. Losing
//! the lease cancels all of that and clears the webhook record (the next
//! leader overwrites it anyway, so a crashed leader is also covered).
//! Every peer, leader or not, feeds the new leader name into the
//! membership view so the relay tree re-roots.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::cluster::{EndpointRecords, LabelPatcher, NodeInventory, PodFeed};
use crate::config::SCHEDULER_NAME;
use crate::election::LeaderState;
use crate::intake::watcher::run_pod_watcher;
use crate::logging::Sampler;
use crate::membership::MemberSet;
use crate::partition::NodePartitioner;
use crate::proto::PodSpec;

pub struct LeaderActivities {
    pub members: Arc<MemberSet>,
    pub inventory: Arc<dyn NodeInventory>,
    pub patcher: Arc<dyn LabelPatcher>,
    pub records: Arc<dyn EndpointRecords>,
    pub pod_feed: Arc<dyn PodFeed>,
    pub pod_queue: mpsc::Sender<PodSpec>,
    pub pod_ip: Option<String>,
    pub webhook_port: u16,
    pub watch_pods: bool,
    pub partition_interval: Duration,
    pub sampler: Sampler,
}

impl LeaderActivities {
    pub async fn run(
        self,
        mut leader_states: watch::Receiver<LeaderState>,
        cancel: CancellationToken,
    ) {
        let pod_name = self.members.pod_name().to_string();
        let mut term: Option<CancellationToken> = None;

        loop {
            let state = leader_states.borrow_and_update().clone();
            tracing::info!(leader = state.leader_name(), "leader update");
            self.members.set_leader(state.leader_name());

            let leading = state.leader.as_deref() == Some(pod_name.as_str());
            if leading && term.is_none() {
                tracing::info!(pod = %pod_name, "became leader");
                let term_cancel = cancel.child_token();
                self.start_term(&term_cancel).await;
                term = Some(term_cancel);
            } else if !leading {
                if let Some(term_cancel) = term.take() {
                    tracing::info!(pod = %pod_name, "lost leadership");
                    term_cancel.cancel();
                    if let Err(err) = self.records.clear_webhook().await {
                        tracing::warn!(error = %err, "failed to clear webhook endpoint record");
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(term_cancel) = term {
                        term_cancel.cancel();
                    }
                    return;
                }
                changed = leader_states.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn start_term(&self, term_cancel: &CancellationToken) {
        let partitioner = NodePartitioner::new(
            self.members.clone(),
            self.inventory.clone(),
            self.patcher.clone(),
            self.partition_interval,
        );
        let partition_cancel = term_cancel.clone();
        tokio::spawn(async move {
            partitioner.run(partition_cancel).await;
        });

        if self.watch_pods {
            tokio::spawn(run_pod_watcher(
                self.pod_feed.clone(),
                self.pod_queue.clone(),
                SCHEDULER_NAME.to_string(),
                self.sampler,
                term_cancel.clone(),
            ));
        }

        match &self.pod_ip {
            Some(ip) => {
                if let Err(err) = self.records.publish_webhook(ip, self.webhook_port).await {
                    tracing::warn!(error = %err, "failed to publish webhook endpoint record");
                }
            }
            None => {
                tracing::warn!("POD_IP not set, webhook endpoint record not published");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use crate::election;

    fn activities(
        cluster: &Arc<MemoryCluster>,
        members: Arc<MemberSet>,
    ) -> (LeaderActivities, mpsc::Receiver<PodSpec>) {
        let (pod_queue, pod_rx) = mpsc::channel(16);
        (
            LeaderActivities {
                members,
                inventory: cluster.clone(),
                patcher: cluster.clone(),
                records: cluster.clone(),
                pod_feed: cluster.clone(),
                pod_queue,
                pod_ip: Some("10.9.8.7".to_string()),
                webhook_port: 8443,
                watch_pods: false,
                partition_interval: Duration::from_secs(30),
                sampler: Sampler::default(),
            },
            pod_rx,
        )
    }

    #[tokio::test]
    async fn webhook_record_follows_leadership() {
        let cluster = MemoryCluster::new();
        let members = Arc::new(MemberSet::new("swarm-sched-a", 10, true));
        let (acts, _pod_rx) = activities(&cluster, members.clone());

        let (leader_tx, leader_rx) = election::static_leader(Some("swarm-sched-a"));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(acts.run(leader_rx, cancel.clone()));

        // Becoming leader publishes the record and re-roots the tree.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            cluster.webhook_record(),
            Some(("10.9.8.7".to_string(), 8443))
        );
        assert_eq!(members.leader(), "swarm-sched-a");

        // Losing leadership clears it.
        leader_tx
            .send(LeaderState::led_by("swarm-sched-b"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cluster.webhook_record(), None);
        assert_eq!(members.leader(), "swarm-sched-b");

        cancel.cancel();
        task.await.unwrap();
    }
}
