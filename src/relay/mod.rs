//! Relay transport: persistent `NewPod` streams to downstream peers.
//!
//! One bidirectional stream is kept per `(destination pod, worker index)`
//! pair so concurrent dispatches never queue behind each other on a single
//! stream. Requests carry a per-stream monotonically increasing id;
//! responses are correlated back to their pending entry by that id and may
//! arrive in any order.

mod codec;
pub mod wire;

pub use wire::WireImage;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::transport::{Channel, Endpoint as ChannelEndpoint};
use tonic::{Request, Status};

use crate::dispatch::CountdownLatch;
use crate::error::{Result, SchedError};
use crate::logging::Sampler;
use crate::membership::Endpoint;
use codec::RawFrameCodec;

const NEW_POD_PATH: &str = "/podrelay.PodRelay/NewPod";

/// Outbound frames buffered per stream before senders see backpressure.
const STREAM_BUFFER: usize = 64;

/// Format `addr` for dialing, bracketing bare IPv6 addresses.
pub fn grpc_address(addr: &str, port: u16) -> String {
    if addr.contains(':') {
        format!("[{addr}]:{port}")
    } else {
        format!("{addr}:{port}")
    }
}

/// An in-flight relay send awaiting its response.
#[derive(Debug)]
struct PendingRequest {
    latch: CountdownLatch,
    start: Instant,
    pod_name: String,
}

#[derive(Debug, Default)]
struct PendingMap(Mutex<HashMap<u32, PendingRequest>>);

impl PendingMap {
    fn insert(&self, request_id: u32, pending: PendingRequest) {
        self.0.lock().unwrap().insert(request_id, pending);
    }

    fn remove(&self, request_id: u32) -> Option<PendingRequest> {
        self.0.lock().unwrap().remove(&request_id)
    }
}

/// Sender half of one cached stream.
#[derive(Debug, Clone)]
struct PodStream {
    id: u64,
    frames: mpsc::Sender<Bytes>,
    pending: Arc<PendingMap>,
    next_request_id: Arc<AtomicU32>,
}

type StreamKey = (String, usize);
type StreamMap = Arc<Mutex<HashMap<StreamKey, PodStream>>>;

pub struct RelayPool {
    streams: StreamMap,
    stream_ids: AtomicU64,
    peer_port: u16,
    sampler: Sampler,
}

impl RelayPool {
    pub fn new(peer_port: u16, sampler: Sampler) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            stream_ids: AtomicU64::new(0),
            peer_port,
            sampler,
        }
    }

    /// Replicate one pod to every member of `targets`. Returns the latch a
    /// dispatch waits on; send failures count it down immediately so a dead
    /// peer never stalls the others.
    pub async fn fan_out(
        &self,
        targets: &[Endpoint],
        image: &WireImage,
        ratio: f64,
        worker_index: usize,
    ) -> CountdownLatch {
        let latch = CountdownLatch::new(targets.len(), ratio);
        for target in targets {
            let start = Instant::now();
            match self.send(target, image, &latch, worker_index).await {
                Ok(()) => {
                    tracing::trace!(
                        destination_pod = %target.pod_name,
                        pod = %image.pod_name,
                        elapsed_us = start.elapsed().as_micros() as u64,
                        "relayed pod"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        destination_pod = %target.pod_name,
                        pod = %image.pod_name,
                        error = %err,
                        "failed to relay pod"
                    );
                    latch.count_down();
                }
            }
        }
        latch
    }

    async fn send(
        &self,
        target: &Endpoint,
        image: &WireImage,
        latch: &CountdownLatch,
        worker_index: usize,
    ) -> Result<()> {
        let key = (target.pod_name.clone(), worker_index);
        let stream = {
            let cached = self.streams.lock().unwrap().get(&key).cloned();
            match cached {
                Some(stream) => stream,
                None => self.open(target, key.clone())?,
            }
        };

        let request_id = stream.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        stream.pending.insert(
            request_id,
            PendingRequest {
                latch: latch.clone(),
                start: Instant::now(),
                pod_name: image.pod_name.clone(),
            },
        );

        if stream.frames.send(image.frame(request_id)).await.is_err() {
            // The driver exited; drop this stream and surface the failure.
            stream.pending.remove(request_id);
            self.invalidate(&key, stream.id);
            return Err(SchedError::StreamClosed(target.pod_name.clone()));
        }
        Ok(())
    }

    /// Dial a peer and register the new stream in the cache. The actual
    /// connection is established lazily by the driver task; frames sent in
    /// the meantime are buffered.
    fn open(&self, target: &Endpoint, key: StreamKey) -> Result<PodStream> {
        let address = target
            .addresses
            .first()
            .ok_or_else(|| SchedError::NoAddress(target.pod_name.clone()))?;
        let uri = format!("http://{}", grpc_address(address, self.peer_port));
        let channel = ChannelEndpoint::from_shared(uri)
            .map_err(|err| SchedError::Config(format!("bad peer address: {err}")))?
            .connect_lazy();

        let (frames_tx, frames_rx) = mpsc::channel(STREAM_BUFFER);
        let stream = PodStream {
            id: self.stream_ids.fetch_add(1, Ordering::Relaxed),
            frames: frames_tx,
            pending: Arc::new(PendingMap::default()),
            next_request_id: Arc::new(AtomicU32::new(0)),
        };

        tracing::debug!(
            destination_pod = %target.pod_name,
            worker = key.1,
            "opening relay stream"
        );
        tokio::spawn(run_stream(
            channel,
            frames_rx,
            stream.pending.clone(),
            self.streams.clone(),
            key.clone(),
            stream.id,
            target.pod_name.clone(),
            self.sampler,
        ));

        self.streams.lock().unwrap().insert(key, stream.clone());
        Ok(stream)
    }

    fn invalidate(&self, key: &StreamKey, stream_id: u64) {
        let mut streams = self.streams.lock().unwrap();
        if streams.get(key).is_some_and(|s| s.id == stream_id) {
            streams.remove(key);
        }
    }
}

/// Drives one stream: opens the call, then resolves responses against the
/// pending map until the stream closes. Pending entries left behind on
/// close are released by the dispatch-side wait timeout, not here.
#[allow(clippy::too_many_arguments)]
async fn run_stream(
    channel: Channel,
    frames: mpsc::Receiver<Bytes>,
    pending: Arc<PendingMap>,
    streams: StreamMap,
    key: StreamKey,
    stream_id: u64,
    destination: String,
    sampler: Sampler,
) {
    let result = async {
        let mut grpc = Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|err| Status::unavailable(format!("peer unavailable: {err}")))?;

        let request = Request::new(ReceiverStream::new(frames));
        let path = PathAndQuery::from_static(NEW_POD_PATH);
        let mut inbound = grpc
            .streaming(request, path, RawFrameCodec)
            .await?
            .into_inner();

        while let Some(response) = inbound.message().await? {
            match pending.remove(response.request_id) {
                Some(entry) => {
                    entry.latch.count_down();
                    if sampler.should_log(&entry.pod_name) {
                        tracing::info!(
                            destination_pod = %destination,
                            pod = %entry.pod_name,
                            elapsed_us = entry.start.elapsed().as_micros() as u64,
                            "relay acknowledged"
                        );
                    }
                }
                None => {
                    tracing::warn!(
                        destination_pod = %destination,
                        request_id = response.request_id,
                        "response for unknown relay request"
                    );
                }
            }
        }
        Ok::<_, Status>(())
    }
    .await;

    match result {
        Ok(()) => tracing::debug!(destination_pod = %destination, "relay stream closed"),
        Err(status) => {
            tracing::warn!(destination_pod = %destination, error = %status, "relay stream failed")
        }
    }

    // Evict ourselves so the next dispatch re-dials, unless a replacement
    // stream already took the slot.
    let mut streams = streams.lock().unwrap();
    if streams.get(&key).is_some_and(|s| s.id == stream_id) {
        streams.remove(&key);
    }
}
