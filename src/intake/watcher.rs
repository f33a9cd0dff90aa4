//! Leader-only pod watcher intake.
//!
//! In watch mode the leader consumes the unscheduled-pod feed and enqueues
//! every pod that requests this scheduler and has no node yet. Non-leaders
//! do not ingest at all; they receive pods through the relay tree.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cluster::PodFeed;
use crate::logging::Sampler;
use crate::proto::PodSpec;

pub async fn run_pod_watcher(
    feed: Arc<dyn PodFeed>,
    queue: mpsc::Sender<PodSpec>,
    scheduler_name: String,
    sampler: Sampler,
    cancel: CancellationToken,
) {
    tracing::info!("pod watcher started");
    let mut pods = feed.subscribe();
    loop {
        let pod = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("pod watcher stopped");
                return;
            }
            received = pods.recv() => match received {
                Ok(pod) => pod,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "pod watcher lagged behind the feed");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    tracing::info!("pod feed closed, watcher exiting");
                    return;
                }
            },
        };

        if pod.scheduler_name != scheduler_name || !pod.node_name.is_empty() {
            continue;
        }
        if sampler.should_log(&pod.key()) {
            tracing::info!(
                pod = %pod.name,
                namespace = %pod.namespace,
                "unscheduled pod observed"
            );
        }
        if queue.send(pod).await.is_err() {
            tracing::info!("pod queue closed, watcher exiting");
            return;
        }
    }
}
