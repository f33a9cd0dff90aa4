//! Peer-facing gRPC server.
//!
//! `NewPod` frames are processed in order per stream: decode, dispatch
//! (which may relay further down the tree using the received payload
//! bytes), then echo the request id. Cross-stream parallelism comes from
//! upstream keying streams by worker index. `CollectScore` parks the
//! caller on the per-pod evaluator until a winner is chosen.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use prost::Message;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use crate::dispatch::{DispatchCore, IndexPool, RelaySource};
use crate::logging::Sampler;
use crate::proto::pod_relay_server::{PodRelay, PodRelayServer};
use crate::proto::{NewPodRequest, NewPodResponse, PermitReply, PodSpec, SchedulingScore};
use crate::score::{Score, ScoreBoard};

pub struct PeerServer {
    dispatch: Arc<DispatchCore>,
    scores: Arc<ScoreBoard>,
    worker_indexes: Arc<IndexPool>,
    sampler: Sampler,
}

impl PeerServer {
    pub fn new(dispatch: Arc<DispatchCore>, scores: Arc<ScoreBoard>, sampler: Sampler) -> Self {
        Self {
            dispatch,
            scores,
            worker_indexes: Arc::new(IndexPool::new()),
            sampler,
        }
    }
}

#[tonic::async_trait]
impl PodRelay for PeerServer {
    type NewPodStream = ReceiverStream<Result<NewPodResponse, Status>>;

    async fn new_pod(
        &self,
        request: Request<Streaming<NewPodRequest>>,
    ) -> Result<Response<Self::NewPodStream>, Status> {
        let mut inbound = request.into_inner();
        let (responses, response_stream) = mpsc::channel(32);

        let dispatch = Arc::clone(&self.dispatch);
        let worker_indexes = Arc::clone(&self.worker_indexes);
        let sampler = self.sampler;
        tokio::spawn(async move {
            loop {
                let frame = match inbound.message().await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(status) => {
                        tracing::debug!(error = %status, "inbound relay stream closed");
                        break;
                    }
                };
                let request_id = frame.request_id;

                let pod = match PodSpec::decode(frame.pod.clone()) {
                    Ok(pod) => pod,
                    Err(err) => {
                        tracing::warn!(request_id, error = %err, "malformed pod payload");
                        let _ = responses
                            .send(Err(Status::invalid_argument("malformed pod payload")))
                            .await;
                        break;
                    }
                };

                let started = Instant::now();
                let verbose = sampler.should_log(&pod.key());
                if verbose {
                    tracing::info!(pod = %pod.name, namespace = %pod.namespace, "received relayed pod");
                }

                let worker_index = worker_indexes.acquire();
                let result = dispatch
                    .process_one(worker_index, pod, Some(RelaySource::Received(frame.pod)))
                    .await;
                worker_indexes.release(worker_index);
                if let Err(err) = result {
                    tracing::error!(request_id, error = %err, "failed to process relayed pod");
                }
                if verbose {
                    tracing::info!(
                        request_id,
                        elapsed_us = started.elapsed().as_micros() as u64,
                        "relayed pod processed"
                    );
                }

                if responses
                    .send(Ok(NewPodResponse { request_id }))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(response_stream)))
    }

    async fn collect_score(
        &self,
        request: Request<SchedulingScore>,
    ) -> Result<Response<PermitReply>, Status> {
        let score = request.into_inner();
        tracing::trace!(
            pod = %score.pod_name,
            namespace = %score.namespace,
            node = %score.node_name,
            score = score.score,
            "collecting score"
        );

        let key = format!("{}/{}", score.namespace, score.pod_name);
        let outcome = self
            .scores
            .record_and_wait(
                &key,
                Score {
                    node_name: score.node_name,
                    score: i64::from(score.score),
                },
            )
            .await;

        Ok(Response::new(PermitReply {
            permit: outcome.permit,
        }))
    }
}

/// Serve the peer RPC endpoint until `cancel` fires. Failing to bind is
/// fatal and surfaces to the caller.
pub async fn serve(
    addr: SocketAddr,
    server: PeerServer,
    cancel: CancellationToken,
) -> crate::Result<()> {
    tracing::info!(addr = %addr, "starting peer gRPC server");
    Server::builder()
        .add_service(PodRelayServer::new(server))
        .serve_with_shutdown(addr, cancel.cancelled_owned())
        .await?;
    Ok(())
}
