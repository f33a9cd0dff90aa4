//! Pod intake: how new pods reach the local queue.
//!
//! Exactly one source is active per deployment: the admission webhook
//! (default, on whichever peer the webhook endpoint record points at) or
//! the leader-only unscheduled-pod watcher.

pub mod watcher;
pub mod webhook;

use tokio::sync::mpsc;

use crate::proto::PodSpec;

/// The bounded pod queue. Producers block when it is full, so backpressure
/// reaches admission instead of dropping pods.
pub fn pod_queue(capacity: usize) -> (mpsc::Sender<PodSpec>, mpsc::Receiver<PodSpec>) {
    mpsc::channel(capacity)
}
