//! Dispatch core: per-pod orchestration.
//!
//! A fixed set of workers drains the pod queue. Each dispatch fans the pod
//! out to this peer's relay sub-members, runs one scheduling cycle on a
//! pooled engine, and finally waits (briefly) for the sub-members to
//! acknowledge. Workers never propagate errors to each other; a failed pod
//! is logged and the worker moves on.

mod latch;
mod pool;

pub use latch::CountdownLatch;
pub use pool::{EngineStack, IndexPool};

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::error::Result;
use crate::logging::Sampler;
use crate::membership::MemberSet;
use crate::proto::PodSpec;
use crate::relay::{RelayPool, WireImage};

/// Typed handle the engine and permit stage use to tell the dispatcher it
/// may reclaim the engine. The channel is buffered so late signals (there
/// can be several per dispatch) never block, and extras are dropped.
#[derive(Debug, Clone)]
pub struct DoneSignal {
    tx: mpsc::Sender<()>,
}

impl DoneSignal {
    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

pub fn done_channel() -> (DoneSignal, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(4);
    (DoneSignal { tx }, rx)
}

/// Where the bytes for a relayed frame come from.
pub enum RelaySource {
    /// Locally-ingested pod: encode it (once) if fan-out is needed.
    Encode,
    /// Frame received from upstream: reuse its payload bytes verbatim.
    Received(Bytes),
}

pub struct DispatchCore {
    engines: EngineStack<Arc<Engine>>,
    relay: RelayPool,
    members: Arc<MemberSet>,
    relay_only: bool,
    wait_for_subschedulers: f64,
    subscheduler_wait: Duration,
    sampler: Sampler,
}

impl DispatchCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engines: Vec<Arc<Engine>>,
        relay: RelayPool,
        members: Arc<MemberSet>,
        relay_only: bool,
        wait_for_subschedulers: f64,
        subscheduler_wait: Duration,
        sampler: Sampler,
    ) -> Self {
        Self {
            engines: EngineStack::new(engines),
            relay,
            members,
            relay_only,
            wait_for_subschedulers,
            subscheduler_wait,
            sampler,
        }
    }

    /// Spawn `num_workers` dispatchers over the shared pod queue. Workers
    /// exit between pods once `cancel` fires.
    pub fn spawn_workers(
        self: &Arc<Self>,
        queue: mpsc::Receiver<PodSpec>,
        num_workers: usize,
        cancel: CancellationToken,
    ) {
        let queue = Arc::new(tokio::sync::Mutex::new(queue));
        for worker_index in 0..num_workers {
            let core = Arc::clone(self);
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let pod = {
                        let mut queue = queue.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                tracing::info!(worker = worker_index, "dispatch worker stopping");
                                return;
                            }
                            pod = queue.recv() => match pod {
                                Some(pod) => pod,
                                None => return,
                            },
                        }
                    };
                    if let Err(err) = core
                        .process_one(worker_index, pod, Some(RelaySource::Encode))
                        .await
                    {
                        tracing::error!(worker = worker_index, error = %err, "failed to process pod");
                    }
                }
            });
        }
    }

    /// Run one pod through relay fan-out, local scheduling, and the
    /// sub-scheduler wait. `relay_source` is `None` to skip fan-out (the
    /// frame already reached the whole subtree some other way).
    pub async fn process_one(
        &self,
        worker_index: usize,
        pod: PodSpec,
        relay_source: Option<RelaySource>,
    ) -> Result<()> {
        let key = pod.key();
        let verbose = self.sampler.should_log(&key);
        if verbose {
            tracing::info!(
                pod = %pod.name,
                namespace = %pod.namespace,
                worker = worker_index,
                available_engines = self.engines.len(),
                "processing pod"
            );
        }

        // Fan out first so the subtree schedules concurrently with us.
        let mut relay_latch = None;
        if let Some(source) = relay_source {
            let targets = self.members.sub_members();
            if !targets.is_empty() {
                let image = match source {
                    RelaySource::Encode => WireImage::from_pod(&pod),
                    RelaySource::Received(payload) => WireImage::from_encoded(payload, &pod),
                };
                let started = Instant::now();
                let latch = self
                    .relay
                    .fan_out(&targets, &image, self.wait_for_subschedulers, worker_index)
                    .await;
                if verbose {
                    tracing::info!(
                        pod = %pod.name,
                        targets = targets.len(),
                        elapsed_us = started.elapsed().as_micros() as u64,
                        "relay fan-out finished"
                    );
                }
                relay_latch = Some(latch);
            }
        }

        if !self.relay_only {
            let engine = self.engines.pop().await;
            engine.install(pod.clone());

            let (done, mut done_rx) = done_channel();
            let task_engine = Arc::clone(&engine);
            let started = Instant::now();
            tokio::spawn(async move {
                let outcome = task_engine.schedule_one(&done).await;
                tracing::trace!(?outcome, "schedule cycle finished");
                // Completion releases the dispatcher even when neither the
                // permit stage nor the failure path ran.
                done.notify();
            });

            // One signal is enough: the engine's remaining work (the
            // aggregator round trip, binding) no longer needs its slot.
            let _ = done_rx.recv().await;
            self.engines.push(engine);
            if verbose {
                tracing::info!(
                    pod = %pod.name,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "local scheduling released"
                );
            }
        }

        if let Some(latch) = relay_latch {
            let started = Instant::now();
            if tokio::time::timeout(self.subscheduler_wait, latch.wait())
                .await
                .is_err()
            {
                tracing::info!(
                    pod = %pod.name,
                    "timed out waiting for sub-scheduler acknowledgements"
                );
            } else if verbose {
                tracing::info!(
                    pod = %pod.name,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "sub-schedulers acknowledged"
                );
            }
        }
        Ok(())
    }
}
