//! End-to-end scenarios over real loopback gRPC peers.


use std::collections::HashSet;
use std::time::Duration;

use test_harness::{test_pod, PeerSpec, TestCluster};

/// Two peers, one pod: the pod is relayed, both peers score, and exactly
/// one binding lands.
#[tokio::test(flavor = "multi_thread")]
async fn two_peer_happy_path_binds_exactly_once() {
    let harness = TestCluster::start(
        &[
            PeerSpec::scheduler("swarm-sched-a"),
            PeerSpec::scheduler("swarm-sched-b"),
        ],
        42011,
    )
    .await;
    harness.seed_nodes(6);

    // Wait for the leader's partitioner to hand each peer some nodes.
    assert!(
        harness
            .wait_for(Duration::from_secs(5), |cluster| {
                let counts = cluster.group_counts();
                counts.get("swarm-sched-a").copied().unwrap_or(0) == 3
                    && counts.get("swarm-sched-b").copied().unwrap_or(0) == 3
            })
            .await,
        "partitioner never balanced the inventory: {:?}",
        harness.cluster.group_counts()
    );

    harness.submit_pod("swarm-sched-a", test_pod("web-1")).await;

    assert!(
        harness
            .wait_for(Duration::from_secs(5), |cluster| !cluster
                .bindings()
                .is_empty())
            .await,
        "pod never bound"
    );
    // Give a hypothetical duplicate bind time to appear, then check.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let bindings = harness.cluster.bindings();
    assert_eq!(bindings.len(), 1, "expected exactly one binding: {bindings:?}");
    assert_eq!(bindings[0].pod_key, "default/web-1");

    harness.shutdown();
}

/// A burst of pods across two peers: every pod binds exactly once, with no
/// duplicates anywhere.
#[tokio::test(flavor = "multi_thread")]
async fn pod_burst_has_unique_winners() {
    let harness = TestCluster::start(
        &[
            PeerSpec::scheduler("swarm-sched-a"),
            PeerSpec::scheduler("swarm-sched-b"),
        ],
        42021,
    )
    .await;
    harness.seed_nodes(8);
    assert!(
        harness
            .wait_for(Duration::from_secs(5), |cluster| cluster
                .group_counts()
                .values()
                .sum::<usize>()
                == 8)
            .await
    );

    const PODS: usize = 40;
    for i in 0..PODS {
        harness
            .submit_pod("swarm-sched-a", test_pod(&format!("burst-{i:02}")))
            .await;
    }

    assert!(
        harness
            .wait_for(Duration::from_secs(20), |cluster| cluster.bindings().len() >= PODS)
            .await,
        "only {} of {PODS} pods bound",
        harness.cluster.bindings().len()
    );

    let bindings = harness.cluster.bindings();
    assert_eq!(bindings.len(), PODS);
    let keys: HashSet<&str> = bindings.iter().map(|b| b.pod_key.as_str()).collect();
    assert_eq!(keys.len(), PODS, "duplicate winners: {bindings:?}");

    harness.shutdown();
}

/// Solo mode: a single peer with no discoverable members schedules
/// end-to-end against itself.
#[tokio::test(flavor = "multi_thread")]
async fn solo_peer_schedules_against_itself() {
    let harness = solo_harness(42032).await;
    harness.seed_nodes(2);
    assert!(
        harness
            .wait_for(Duration::from_secs(5), |cluster| {
                cluster
                    .group_counts()
                    .get("swarm-sched-solo")
                    .copied()
                    .unwrap_or(0)
                    == 2
            })
            .await,
        "solo partitioner never claimed the nodes"
    );

    harness
        .submit_pod("swarm-sched-solo", test_pod("solo-pod"))
        .await;
    assert!(
        harness
            .wait_for(Duration::from_secs(5), |cluster| cluster.bindings().len() == 1)
            .await,
        "solo pod never bound"
    );
    assert_eq!(harness.cluster.bindings()[0].bound_by, "swarm-sched-solo");

    harness.shutdown();
}

/// Builds a one-peer cluster with allow_solo and no membership slice.
async fn solo_harness(port: u16) -> TestCluster {
    use std::sync::Arc;
    use swarm_sched::cluster::{MemoryBinder, MemoryCluster};
    use swarm_sched::config::SchedulerConfig;
    use swarm_sched::election::LeaderState;
    use swarm_sched::node::{ClusterHandles, Node};
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;

    let cluster = MemoryCluster::new();
    let cancel = CancellationToken::new();
    let (leader_tx, leader_rx) = watch::channel(LeaderState::led_by("swarm-sched-solo"));

    let config = SchedulerConfig {
        pod_name: "swarm-sched-solo".to_string(),
        pod_ip: Some("127.0.0.1".to_string()),
        grpc_addr: format!("127.0.0.1:{port}").parse().unwrap(),
        peer_port: port,
        num_workers: 2,
        num_engines: 4,
        allow_solo: true,
        watch_pods: true,
        queue_capacity: 1024,
        aggregation_deadline: Duration::from_millis(1500),
        subscheduler_wait: Duration::from_millis(500),
        partition_interval: Duration::from_millis(200),
        log_sample_rate: 1_000_000,
        ..SchedulerConfig::default()
    };
    let binder = Arc::new(MemoryBinder::new(cluster.clone(), "swarm-sched-solo"));
    let handles = ClusterHandles {
        inventory: cluster.clone(),
        patcher: cluster.clone(),
        records: cluster.clone(),
        pod_feed: cluster.clone(),
        binder,
    };
    let (node, channels) = Node::new(config, handles);
    let peer_cancel = cancel.child_token();
    let run_cancel = peer_cancel.clone();
    let handle = tokio::spawn(async move {
        let _ = node.run(leader_rx, run_cancel).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut peers = std::collections::HashMap::new();
    peers.insert(
        "swarm-sched-solo".to_string(),
        test_harness::TestPeer::from_parts(
            "swarm-sched-solo".to_string(),
            channels,
            peer_cancel,
            handle,
        ),
    );
    TestCluster::from_parts(cluster, peers, leader_tx, cancel)
}

/// Every peer reports score 0: the aggregator still completes, nobody is
/// permitted, and the pod stays unbound.
#[tokio::test(flavor = "multi_thread")]
async fn all_zero_scores_leave_pod_unbound() {
    let harness = TestCluster::start(
        &[
            PeerSpec::scheduler("swarm-sched-a"),
            PeerSpec::scheduler("swarm-sched-b"),
        ],
        42041,
    )
    .await;
    // No nodes seeded: every peer's partition is empty, so every peer
    // reports a zero score.

    harness
        .submit_pod("swarm-sched-a", test_pod("doomed-pod"))
        .await;

    // Aggregation deadline is 1.5 s in the harness; give it room to fire.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(
        harness.cluster.bindings().is_empty(),
        "zero-score pod must not bind: {:?}",
        harness.cluster.bindings()
    );

    harness.shutdown();
}

/// A dead relay target neither blocks the dispatch nor produces duplicate
/// bindings.
#[tokio::test(flavor = "multi_thread")]
async fn dead_peer_does_not_stall_dispatch() {
    let mut harness = TestCluster::start(
        &[
            PeerSpec::scheduler("swarm-sched-a"),
            PeerSpec::scheduler("swarm-sched-b"),
        ],
        42051,
    )
    .await;
    harness.seed_nodes(4);
    assert!(
        harness
            .wait_for(Duration::from_secs(5), |cluster| cluster
                .group_counts()
                .values()
                .sum::<usize>()
                == 4)
            .await
    );

    // Kill peer B outright; its endpoint stays in the membership, so A
    // keeps relaying at it and keeps hashing scores at it.
    harness.kill_peer("swarm-sched-b");
    tokio::time::sleep(Duration::from_millis(100)).await;

    for i in 0..6 {
        harness
            .submit_pod("swarm-sched-a", test_pod(&format!("orphan-{i}")))
            .await;
    }

    // Pods whose aggregator hashes to the dead peer are denied; the rest
    // bind on A. Either way dispatch keeps draining the queue and nothing
    // binds twice.
    tokio::time::sleep(Duration::from_secs(6)).await;
    let bindings = harness.cluster.bindings();
    let keys: HashSet<&str> = bindings.iter().map(|b| b.pod_key.as_str()).collect();
    assert_eq!(keys.len(), bindings.len(), "duplicate binding: {bindings:?}");
    for binding in &bindings {
        assert_eq!(binding.bound_by, "swarm-sched-a");
    }

    harness.shutdown();
}

/// Leader handoff: the webhook record moves with the lease and the
/// partition labels reconverge on the new membership.
#[tokio::test(flavor = "multi_thread")]
async fn leader_handoff_reconverges() {
    let mut harness = TestCluster::start(
        &[
            PeerSpec::scheduler("swarm-sched-a"),
            PeerSpec::scheduler("swarm-sched-b"),
        ],
        42061,
    )
    .await;
    harness.seed_nodes(4);
    assert!(
        harness
            .wait_for(Duration::from_secs(5), |cluster| {
                cluster.webhook_record().is_some()
                    && cluster.group_counts().values().sum::<usize>() == 4
            })
            .await
    );
    assert_eq!(
        harness.cluster.webhook_record().unwrap().0,
        "127.0.0.1",
        "record points at the first leader"
    );

    // Peer A crashes: the lease moves to B and the membership loses A.
    // B's start-of-term overwrite is what repoints the record, since the
    // dead leader can no longer clear it.
    harness.kill_peer("swarm-sched-a");
    harness.set_leader("swarm-sched-b");
    harness.remove_from_membership("swarm-sched-a").await;

    assert!(
        harness
            .wait_for(Duration::from_secs(5), |cluster| {
                cluster
                    .webhook_record()
                    .is_some_and(|(ip, _)| ip == "127.0.0.2")
            })
            .await,
        "webhook record never moved to the new leader"
    );
    assert!(
        harness
            .wait_for(Duration::from_secs(5), |cluster| {
                let counts = cluster.group_counts();
                counts.get("swarm-sched-b").copied().unwrap_or(0) == 4
            })
            .await,
        "partition never reconverged on the new leader: {:?}",
        harness.cluster.group_counts()
    );

    harness.shutdown();
}
