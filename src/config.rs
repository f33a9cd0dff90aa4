use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SchedError};

/// Scheduler name pods must request to be handled by this system.
pub const SCHEDULER_NAME: &str = "swarm-sched";

/// Peers whose pod name starts with this prefix relay but never schedule.
pub const RELAY_PREFIX: &str = "swarm-sched-relay";

/// Node label naming the scheduler peer that owns the node.
pub const PARTITION_LABEL: &str = "swarm-sched.dev/scheduler";

/// Endpoint record advertising the admission webhook on the current leader.
pub const WEBHOOK_ENDPOINT_NAME: &str = "swarm-sched-webhook";

pub const DEFAULT_PEER_PORT: u16 = 50051;
pub const DEFAULT_POD_QUEUE_SIZE: usize = 1_000_000;
pub const DEFAULT_NUM_WORKERS: usize = 8;
pub const DEFAULT_NUM_ENGINES: usize = 100;
pub const DEFAULT_FAN_OUT: usize = 10;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// This peer's pod name; also its identity in the membership sort.
    pub pod_name: String,
    pub pod_namespace: String,
    /// Advertised IP for the webhook endpoint record (leader only).
    pub pod_ip: Option<String>,

    pub grpc_addr: SocketAddr,
    pub webhook_addr: SocketAddr,
    /// Port peers dial for NewPod/CollectScore.
    pub peer_port: u16,

    /// Concurrent dispatch workers pulling from the pod queue.
    pub num_workers: usize,
    /// Pre-built scheduling engines in the reuse pool.
    pub num_engines: usize,
    /// Branching factor of the relay tree.
    pub fan_out: usize,
    /// Fraction of sub-scheduler acknowledgements to wait for, in [0, 1].
    pub wait_for_subschedulers: f64,

    pub queue_capacity: usize,
    /// How long an aggregator waits for scores before firing.
    pub aggregation_deadline: Duration,
    /// How long a dispatch waits on sub-scheduler acknowledgements.
    pub subscheduler_wait: Duration,
    /// Minimum spacing between node partition rebalances.
    pub partition_interval: Duration,

    pub leader_eligible: bool,
    pub relay_only: bool,
    /// Leader ingests pods from the unscheduled-pod feed instead of the
    /// admission webhook.
    pub watch_pods: bool,
    /// Debug switch: the permit stage denies every pod.
    pub permit_always_deny: bool,
    /// Run stand-alone when no peers are discoverable.
    pub allow_solo: bool,

    /// `key=value` selector restricting which nodes the leader tracks.
    pub node_selector: Option<String>,
    /// Directory holding `tls.crt`/`tls.key` for the webhook server.
    pub cert_dir: Option<PathBuf>,
    /// 1-in-N sampling rate for high-frequency per-pod logging.
    pub log_sample_rate: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pod_name: "swarm-sched-0".to_string(),
            pod_namespace: "default".to_string(),
            pod_ip: None,
            grpc_addr: "0.0.0.0:50051".parse().unwrap(),
            webhook_addr: "0.0.0.0:8443".parse().unwrap(),
            peer_port: DEFAULT_PEER_PORT,
            num_workers: DEFAULT_NUM_WORKERS,
            num_engines: DEFAULT_NUM_ENGINES,
            fan_out: DEFAULT_FAN_OUT,
            wait_for_subschedulers: 1.0,
            queue_capacity: DEFAULT_POD_QUEUE_SIZE,
            aggregation_deadline: Duration::from_secs(5),
            subscheduler_wait: Duration::from_secs(1),
            partition_interval: Duration::from_secs(30),
            leader_eligible: true,
            relay_only: false,
            watch_pods: false,
            permit_always_deny: false,
            allow_solo: false,
            node_selector: None,
            cert_dir: None,
            log_sample_rate: 100,
        }
    }
}

impl SchedulerConfig {
    /// Fold `POD_NAME`, `POD_NAMESPACE`, `POD_IP` and `ALLOW_SOLO` into the
    /// config. The first two are required in a real deployment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.pod_name = std::env::var("POD_NAME").map_err(|_| SchedError::MissingEnv("POD_NAME"))?;
        self.pod_namespace =
            std::env::var("POD_NAMESPACE").map_err(|_| SchedError::MissingEnv("POD_NAMESPACE"))?;
        self.pod_ip = std::env::var("POD_IP").ok().filter(|ip| !ip.is_empty());
        if std::env::var("ALLOW_SOLO").as_deref() == Ok("true") {
            self.allow_solo = true;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pod_name.is_empty() {
            return Err(SchedError::Config("pod name must not be empty".into()));
        }
        if self.num_workers == 0 {
            return Err(SchedError::Config("num_workers must be at least 1".into()));
        }
        if !self.relay_only && self.num_engines < self.num_workers {
            return Err(SchedError::Config(format!(
                "num_engines ({}) must not be below num_workers ({})",
                self.num_engines, self.num_workers
            )));
        }
        if self.fan_out == 0 {
            return Err(SchedError::Config("fan_out must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.wait_for_subschedulers) {
            return Err(SchedError::Config(format!(
                "wait_for_subschedulers must be within [0, 1], got {}",
                self.wait_for_subschedulers
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SchedulerConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_wait_ratio() {
        let mut config = SchedulerConfig::default();
        config.wait_for_subschedulers = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_engine_pool_smaller_than_workers() {
        let mut config = SchedulerConfig::default();
        config.num_engines = 4;
        config.num_workers = 8;
        assert!(config.validate().is_err());

        config.relay_only = true;
        config.validate().unwrap();
    }
}
