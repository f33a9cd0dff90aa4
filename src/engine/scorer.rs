//! Node scoring for the local scheduling pass.
//!
//! Candidates that cannot fit the pod's resource request are rejected
//! outright. Feasible nodes get a weighted combination of:
//! - **least-allocated**: prefer nodes with more free memory/CPU after
//!   placement, spreading load across the partition
//! - **spread**: prefer nodes running fewer pods
//!
//! Scores land in 1..=100 so that 0 stays reserved as the cluster-wide
//! "not schedulable here" sentinel.

use serde::{Deserialize, Serialize};

use crate::proto::PodSpec;
use crate::score::Score;

/// Resource capacity and usage for one node this peer owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResources {
    pub name: String,
    pub capacity_memory_bytes: u64,
    pub capacity_cpu_millis: u64,
    pub used_memory_bytes: u64,
    pub used_cpu_millis: u64,
    pub pod_count: u32,
}

impl NodeResources {
    pub fn free_memory(&self) -> u64 {
        self.capacity_memory_bytes.saturating_sub(self.used_memory_bytes)
    }

    pub fn free_cpu(&self) -> u64 {
        self.capacity_cpu_millis.saturating_sub(self.used_cpu_millis)
    }
}

#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub least_allocated: f64,
    pub spread: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            least_allocated: 0.7,
            spread: 0.3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scorer {
    weights: ScoringWeights,
}

impl Scorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    /// Score every feasible node for `pod`. An empty result means the pod
    /// cannot run anywhere in this partition.
    pub fn score_nodes(&self, nodes: &[NodeResources], pod: &PodSpec) -> Vec<Score> {
        let request = pod.resources.clone().unwrap_or_default();
        nodes
            .iter()
            .filter(|node| {
                node.free_memory() >= request.memory_bytes && node.free_cpu() >= request.cpu_millis
            })
            .map(|node| Score {
                node_name: node.name.clone(),
                score: self.score_one(node, request.memory_bytes, request.cpu_millis),
            })
            .collect()
    }

    fn score_one(&self, node: &NodeResources, memory_bytes: u64, cpu_millis: u64) -> i64 {
        let free_memory_after = node.free_memory().saturating_sub(memory_bytes);
        let free_cpu_after = node.free_cpu().saturating_sub(cpu_millis);

        let memory_fraction = if node.capacity_memory_bytes > 0 {
            free_memory_after as f64 / node.capacity_memory_bytes as f64
        } else {
            0.0
        };
        let cpu_fraction = if node.capacity_cpu_millis > 0 {
            free_cpu_after as f64 / node.capacity_cpu_millis as f64
        } else {
            0.0
        };
        let least_allocated = (memory_fraction + cpu_fraction) / 2.0;
        let spread = 1.0 / (1.0 + f64::from(node.pod_count));

        let combined =
            self.weights.least_allocated * least_allocated + self.weights.spread * spread;
        ((combined * 100.0).round() as i64).clamp(1, 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ResourceRequest;

    fn node(name: &str, used_memory: u64, used_cpu: u64, pods: u32) -> NodeResources {
        NodeResources {
            name: name.to_string(),
            capacity_memory_bytes: 16 << 30,
            capacity_cpu_millis: 8000,
            used_memory_bytes: used_memory,
            used_cpu_millis: used_cpu,
            pod_count: pods,
        }
    }

    fn pod(memory: u64, cpu: u64) -> PodSpec {
        PodSpec {
            name: "p".into(),
            namespace: "default".into(),
            resources: Some(ResourceRequest {
                memory_bytes: memory,
                cpu_millis: cpu,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_nodes_that_cannot_fit() {
        let scorer = Scorer::default();
        let nodes = vec![node("full", 16 << 30, 8000, 40), node("free", 0, 0, 0)];
        let scores = scorer.score_nodes(&nodes, &pod(1 << 30, 500));
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].node_name, "free");
    }

    #[test]
    fn prefers_emptier_nodes() {
        let scorer = Scorer::default();
        let nodes = vec![node("busy", 12 << 30, 6000, 30), node("idle", 1 << 30, 500, 2)];
        let scores = scorer.score_nodes(&nodes, &pod(1 << 30, 500));
        let busy = scores.iter().find(|s| s.node_name == "busy").unwrap();
        let idle = scores.iter().find(|s| s.node_name == "idle").unwrap();
        assert!(idle.score > busy.score, "{idle:?} vs {busy:?}");
    }

    #[test]
    fn feasible_nodes_never_score_zero() {
        let scorer = Scorer::default();
        // Node left with no headroom after placement still scores >= 1.
        let nodes = vec![node("tight", 15 << 30, 7500, 60)];
        let scores = scorer.score_nodes(&nodes, &pod(1 << 30, 500));
        assert_eq!(scores.len(), 1);
        assert!(scores[0].score >= 1);
    }

    #[test]
    fn pod_without_requests_fits_anywhere() {
        let scorer = Scorer::default();
        let nodes = vec![node("full", 16 << 30, 8000, 40)];
        let mut empty_pod = pod(0, 0);
        empty_pod.resources = None;
        assert_eq!(scorer.score_nodes(&nodes, &empty_pod).len(), 1);
    }
}
