//! Admission webhook handler tests, driven through the router directly.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;

use swarm_sched::intake::webhook::{router, WebhookState};
use swarm_sched::logging::Sampler;
use swarm_sched::proto::PodSpec;

fn test_state() -> (axum::Router, mpsc::Receiver<PodSpec>) {
    let (queue, queue_rx) = mpsc::channel(16);
    let state = WebhookState {
        queue,
        scheduler_name: "swarm-sched".to_string(),
        sampler: Sampler::default(),
    };
    (router(state), queue_rx)
}

fn review(scheduler_name: &str) -> Value {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "review-uid-1",
            "object": {
                "metadata": {
                    "name": "web-100",
                    "namespace": "default",
                    "uid": "pod-uid-1",
                    "labels": {"app": "web"}
                },
                "spec": {
                    "schedulerName": scheduler_name,
                    "containers": [
                        {"resources": {"requests": {"cpu": "250m", "memory": "128Mi"}}},
                        {"resources": {"requests": {"cpu": "1", "memory": "1Gi"}}}
                    ]
                }
            }
        }
    })
}

fn post(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/validate")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn matching_pod_is_allowed_and_enqueued() {
    let (app, mut queue_rx) = test_state();

    let response = app.oneshot(post(review("swarm-sched"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let reply: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(reply["response"]["allowed"], json!(true));
    assert_eq!(reply["response"]["uid"], json!("review-uid-1"));

    let pod = tokio::time::timeout(std::time::Duration::from_secs(1), queue_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pod.name, "web-100");
    assert_eq!(pod.namespace, "default");
    let resources = pod.resources.unwrap();
    assert_eq!(resources.cpu_millis, 1250);
    assert_eq!(resources.memory_bytes, (128 << 20) + (1 << 30));
}

#[tokio::test]
async fn other_schedulers_pods_are_allowed_but_not_enqueued() {
    let (app, mut queue_rx) = test_state();

    let response = app
        .oneshot(post(review("default-scheduler")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let reply: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(reply["response"]["allowed"], json!(true));

    tokio::task::yield_now().await;
    assert!(queue_rx.try_recv().is_err());
}

#[tokio::test]
async fn malformed_review_is_rejected() {
    let (app, _queue_rx) = test_state();
    let request = Request::builder()
        .method("POST")
        .uri("/validate")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn review_without_request_is_rejected() {
    let (app, _queue_rx) = test_state();
    let body = json!({"apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview"});

    let response = app.oneshot(post(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_pod_object_is_rejected() {
    let (app, _queue_rx) = test_state();
    let body = json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {"uid": "u", "object": {"metadata": {}, "spec": 42}}
    });

    let response = app.oneshot(post(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let (app, _queue_rx) = test_state();
    let request = Request::builder()
        .method("POST")
        .uri("/other")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
