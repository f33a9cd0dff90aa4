//! Permit stage: the hook between local scheduling and the cluster-wide
//! score aggregation.
//!
//! When the engine has chosen its best local node, the permit plugin ships
//! that score to the aggregator peer owning the pod's key and blocks until
//! the aggregator answers permit or deny. Exactly one peer cluster-wide is
//! permitted per pod; everyone else treats the pod as unschedulable.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint as ChannelEndpoint};

use crate::dispatch::DoneSignal;
use crate::membership::{Endpoint, MemberSet};
use crate::proto::pod_relay_client::PodRelayClient;
use crate::proto::{PodSpec, SchedulingScore};
use crate::relay::grpc_address;
use crate::score::Score;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermitDecision {
    Approved,
    Rejected,
    Error(String),
}

#[async_trait]
pub trait PermitPlugin: Send + Sync {
    /// Decide whether this peer may bind `pod` to `node_name`, given the
    /// engine's local scores. Must signal `done` before any remote wait.
    async fn permit(
        &self,
        done: &DoneSignal,
        pod: &PodSpec,
        node_name: &str,
        scores: &[Score],
    ) -> PermitDecision;

    /// Pre-permit failure path: report a zero score for `pod` so the
    /// aggregator for its key is not left waiting on this peer.
    async fn report_failure(&self, pod: &PodSpec);
}

/// Production permit plugin: scores travel to the aggregator peer over
/// `CollectScore`.
pub struct RemotePermit {
    members: Arc<MemberSet>,
    clients: Mutex<HashMap<String, PodRelayClient<Channel>>>,
    peer_port: u16,
    always_deny: bool,
}

impl RemotePermit {
    pub fn new(members: Arc<MemberSet>, peer_port: u16, always_deny: bool) -> Self {
        Self {
            members,
            clients: Mutex::new(HashMap::new()),
            peer_port,
            always_deny,
        }
    }

    fn client_for(&self, target: &Endpoint) -> Option<PodRelayClient<Channel>> {
        let address = target.addresses.first()?;
        let addr = grpc_address(address, self.peer_port);

        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(&addr) {
            return Some(client.clone());
        }
        let channel = ChannelEndpoint::from_shared(format!("http://{addr}"))
            .ok()?
            .connect_lazy();
        let client = PodRelayClient::new(channel);
        clients.insert(addr, client.clone());
        Some(client)
    }

    /// Send one score to `target` and return the permit. Score 0 is a
    /// fire-and-forget: the answer is known to be a denial, but the
    /// aggregator still needs the score to make progress.
    async fn send_score(
        &self,
        target: &Endpoint,
        pod: &PodSpec,
        node_name: &str,
        score: i64,
    ) -> bool {
        let Some(client) = self.client_for(target) else {
            tracing::warn!(
                destination_pod = %target.pod_name,
                pod = %pod.name,
                "aggregator endpoint has no usable address, denying permit"
            );
            return false;
        };

        let request = SchedulingScore {
            pod_name: pod.name.clone(),
            namespace: pod.namespace.clone(),
            node_name: node_name.to_string(),
            score: score as i32,
        };

        if score == 0 {
            let mut client = client;
            tokio::spawn(async move {
                let _ = client.collect_score(request).await;
            });
            return false;
        }

        let mut client = client;
        match client.collect_score(request).await {
            Ok(response) => response.into_inner().permit,
            Err(status) => {
                tracing::warn!(
                    destination_pod = %target.pod_name,
                    pod = %pod.name,
                    error = %status,
                    "could not deliver score, denying permit"
                );
                false
            }
        }
    }
}

#[async_trait]
impl PermitPlugin for RemotePermit {
    async fn permit(
        &self,
        done: &DoneSignal,
        pod: &PodSpec,
        node_name: &str,
        scores: &[Score],
    ) -> PermitDecision {
        if self.always_deny {
            return PermitDecision::Rejected;
        }

        let Some(local) = scores.iter().find(|s| s.node_name == node_name) else {
            tracing::error!(
                pod = %pod.name,
                namespace = %pod.namespace,
                node = node_name,
                "no local score recorded for chosen node"
            );
            return PermitDecision::Error(format!("no score for node {node_name}"));
        };
        let score = local.score;

        // The dispatcher can reclaim this engine as soon as the score is on
        // its way; only the binding depends on the answer below.
        done.notify();

        let key = pod.key();
        let Some(target) = self.members.target_for_scoring(&key) else {
            tracing::warn!(pod = %pod.name, "no members visible, denying permit");
            return PermitDecision::Rejected;
        };

        tracing::trace!(
            pod = %pod.name,
            namespace = %pod.namespace,
            node = node_name,
            score,
            destination_pod = %target.pod_name,
            "sending score"
        );
        if self.send_score(&target, pod, node_name, score).await {
            PermitDecision::Approved
        } else {
            PermitDecision::Rejected
        }
    }

    async fn report_failure(&self, pod: &PodSpec) {
        let key = pod.key();
        let Some(target) = self.members.target_for_scoring(&key) else {
            return;
        };
        tracing::debug!(
            pod = %pod.name,
            namespace = %pod.namespace,
            destination_pod = %target.pod_name,
            "reporting zero score for unschedulable pod"
        );
        self.send_score(&target, pod, "", 0).await;
    }
}
