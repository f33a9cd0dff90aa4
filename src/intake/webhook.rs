//! Admission webhook intake.
//!
//! The cluster's admission chain POSTs an AdmissionReview for every pod
//! creation. The review is always allowed (this endpoint exists to
//! observe pods, not to gate them) and the response is written without
//! waiting for queue admission: enqueueing happens on a detached task so a
//! full queue backpressures admission retries, not the HTTP reply.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request as HttpRequest, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::error::Result;
use crate::logging::Sampler;
use crate::proto::{PodSpec, ResourceRequest};

#[derive(Debug, Serialize, Deserialize)]
pub struct AdmissionReview {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub uid: String,
    pub object: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
}

/// The slice of a pod manifest this scheduler cares about.
#[derive(Debug, Deserialize)]
struct PodManifest {
    metadata: PodMetadata,
    spec: PodManifestSpec,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    name: String,
    #[serde(default = "default_namespace")]
    namespace: String,
    #[serde(default)]
    uid: String,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PodManifestSpec {
    #[serde(rename = "schedulerName", default)]
    scheduler_name: String,
    #[serde(rename = "nodeName", default)]
    node_name: String,
    #[serde(default)]
    containers: Vec<ContainerManifest>,
}

#[derive(Debug, Deserialize, Default)]
struct ContainerManifest {
    #[serde(default)]
    resources: ContainerResources,
}

#[derive(Debug, Deserialize, Default)]
struct ContainerResources {
    #[serde(default)]
    requests: HashMap<String, String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Clone)]
pub struct WebhookState {
    pub queue: mpsc::Sender<PodSpec>,
    pub scheduler_name: String,
    pub sampler: Sampler,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/validate", post(handle_validate))
        .with_state(state)
}

async fn handle_validate(
    State(state): State<WebhookState>,
    body: axum::body::Bytes,
) -> Response {
    let review: AdmissionReview = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(err) => {
            tracing::warn!(error = %err, "failed to parse admission review");
            return (StatusCode::BAD_REQUEST, "failed to parse admission review").into_response();
        }
    };
    let Some(request) = review.request else {
        return (StatusCode::BAD_REQUEST, "admission review carries no request").into_response();
    };

    let manifest: PodManifest = match serde_json::from_value(request.object) {
        Ok(manifest) => manifest,
        Err(err) => {
            tracing::warn!(uid = %request.uid, error = %err, "failed to parse pod from review");
            return (StatusCode::BAD_REQUEST, "failed to parse pod object").into_response();
        }
    };

    let reply = AdmissionReview {
        api_version: review.api_version,
        kind: review.kind,
        request: None,
        response: Some(AdmissionResponse {
            uid: request.uid,
            allowed: true,
        }),
    };

    if manifest.spec.scheduler_name == state.scheduler_name {
        let pod = manifest_to_pod(manifest);
        if state.sampler.should_log(&pod.key()) {
            tracing::info!(
                pod = %pod.name,
                namespace = %pod.namespace,
                "admission review enqueueing pod"
            );
        }
        // Detached so the HTTP response never waits on queue admission.
        let queue = state.queue.clone();
        tokio::spawn(async move {
            if queue.send(pod).await.is_err() {
                tracing::error!("pod queue closed, dropping admitted pod");
            }
        });
    }

    Json(reply).into_response()
}

fn manifest_to_pod(manifest: PodManifest) -> PodSpec {
    let mut memory_bytes = 0u64;
    let mut cpu_millis = 0u64;
    for container in &manifest.spec.containers {
        if let Some(raw) = container.resources.requests.get("memory") {
            memory_bytes += parse_memory(raw).unwrap_or_default();
        }
        if let Some(raw) = container.resources.requests.get("cpu") {
            cpu_millis += parse_cpu(raw).unwrap_or_default();
        }
    }

    PodSpec {
        name: manifest.metadata.name,
        namespace: manifest.metadata.namespace,
        uid: if manifest.metadata.uid.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            manifest.metadata.uid
        },
        scheduler_name: manifest.spec.scheduler_name,
        labels: manifest.metadata.labels,
        resources: Some(ResourceRequest {
            memory_bytes,
            cpu_millis,
        }),
        node_name: manifest.spec.node_name,
    }
}

/// Parse a CPU quantity ("250m", "2") into millicores.
fn parse_cpu(raw: &str) -> Option<u64> {
    if let Some(millis) = raw.strip_suffix('m') {
        return millis.parse().ok();
    }
    let cores: f64 = raw.parse().ok()?;
    Some((cores * 1000.0).round() as u64)
}

/// Parse a memory quantity ("128Mi", "1Gi", "500M", plain bytes).
fn parse_memory(raw: &str) -> Option<u64> {
    const UNITS: &[(&str, u64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    for (suffix, factor) in UNITS {
        if let Some(value) = raw.strip_suffix(suffix) {
            let value: f64 = value.parse().ok()?;
            return Some((value * *factor as f64).round() as u64);
        }
    }
    raw.parse().ok()
}

/// Serve the webhook until `cancel` fires. With TLS configured the accept
/// loop terminates TLS per connection; without it (local development) the
/// router is served over plain HTTP.
pub async fn serve(
    addr: SocketAddr,
    state: WebhookState,
    tls: Option<Arc<rustls::ServerConfig>>,
    cancel: CancellationToken,
) -> Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, tls = tls.is_some(), "starting admission webhook");

    let Some(tls_config) = tls else {
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;
        return Ok(());
    };

    let acceptor = TlsAcceptor::from(tls_config);
    loop {
        let (tcp, remote) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(connection) => connection,
                Err(err) => {
                    tracing::warn!(error = %err, "webhook accept failed");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let tower_service = app.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::debug!(remote = %remote, error = %err, "TLS handshake failed");
                    return;
                }
            };
            let io = TokioIo::new(stream);
            let hyper_service =
                hyper::service::service_fn(move |request: HttpRequest<Incoming>| {
                    tower_service.clone().oneshot(request.map(Body::new))
                });
            if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, hyper_service)
                .await
            {
                tracing::debug!(remote = %remote, error = %err, "webhook connection ended");
            }
        });
    }
}
