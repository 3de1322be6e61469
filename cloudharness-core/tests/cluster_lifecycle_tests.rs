// Cluster bring-up, stabilization and teardown against fake nodes

#![cfg(feature = "test-helpers")]

use cloudharness_core::{
    test_helpers::{attach_config, unused_endpoint, FakeCluster},
    types::NodeRole,
    CancelSignal, ClusterManager, ClusterState, HarnessError,
};
use std::time::Duration;
use tokio::time::Instant;

mod common;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_three_nodes_stabilize() {
    common::init_logging();
    let fakes = FakeCluster::start(3).await.unwrap();
    // Nodes discover each other within a few hundred milliseconds
    for (i, fake) in fakes.nodes.iter().enumerate() {
        fake.report_size_after(Duration::from_millis(100 * i as u64), 3);
    }

    let manager = common::manager_for(&fakes);
    let mut cluster = manager.build_cloud(3).await.unwrap();
    assert_eq!(cluster.state(), ClusterState::Forming);
    assert_eq!(cluster.len(), 3);
    assert_eq!(cluster.node(0).unwrap().role(), NodeRole::Coordinator);
    assert_eq!(cluster.node(2).unwrap().role(), NodeRole::Member);

    manager
        .stabilize(&mut cluster, Duration::from_secs(5), Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(cluster.state(), ClusterState::Stable);
    assert!(cluster
        .last_observed()
        .iter()
        .all(|o| o.reported_size == Some(3)));

    let report = manager.tear_down(&mut cluster).await;
    assert_eq!(report.nodes_shut_down, 3);
    assert!(report.partial_failure.is_none());
    assert_eq!(cluster.state(), ClusterState::TornDown);
    for fake in &fakes.nodes {
        assert_eq!(fake.shutdown_requests(), 1);
    }

    // Second teardown is a no-op
    let report = manager.tear_down(&mut cluster).await;
    assert_eq!(report.nodes_shut_down, 0);
    assert_eq!(fakes.node(0).shutdown_requests(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_of_three_never_form_quorum() {
    common::init_logging();
    let mut fakes = FakeCluster::start(3).await.unwrap();
    fakes.node(0).report_size(2);
    fakes.node(1).report_size(2);

    let manager = common::manager_for(&fakes);
    let mut cluster = manager.build_cloud(3).await.unwrap();
    let missing = fakes.node(2).endpoint();
    fakes.nodes[2].stop().await;

    let err = manager
        .stabilize(&mut cluster, Duration::from_millis(1_500), Duration::from_millis(300))
        .await
        .unwrap_err();

    match &err {
        HarnessError::ClusterFormation {
            expected, observed, ..
        } => {
            assert_eq!(*expected, 3);
            assert_eq!(observed.len(), 3);
            let reachable: Vec<_> = observed
                .iter()
                .filter(|o| o.reported_size.is_some())
                .collect();
            assert_eq!(reachable.len(), 2);
            assert!(reachable.iter().all(|o| o.reported_size == Some(2)));
            let unreachable = observed.iter().find(|o| o.address == missing).unwrap();
            assert!(unreachable.error.is_some());
        }
        other => panic!("expected ClusterFormation, got {other}"),
    }
    assert!(err.to_string().contains("reportedSize=2"));
    assert_eq!(cluster.state(), ClusterState::Forming);

    // The stopped node cannot be shut down; teardown still completes
    let report = manager.tear_down(&mut cluster).await;
    assert_eq!(report.nodes_shut_down, 2);
    let partial = report.partial_failure.unwrap();
    assert_eq!(partial.failures.len(), 1);
    assert_eq!(partial.failures[0].0, missing);
    assert_eq!(cluster.state(), ClusterState::TornDown);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_membership_flap_restarts_debounce() {
    let fakes = FakeCluster::formed(2).await.unwrap();
    let scheduled = Instant::now();
    fakes.node(1).report_size_after(Duration::from_millis(150), 1);
    fakes.node(1).report_size_after(Duration::from_millis(300), 2);

    let manager = common::manager_for(&fakes);
    let mut cluster = manager.build_cloud(2).await.unwrap();
    manager
        .stabilize(&mut cluster, Duration::from_secs(5), Duration::from_millis(400))
        .await
        .unwrap();

    // Agreement only counts from the end of the flap
    assert!(scheduled.elapsed() >= Duration::from_millis(650));
    assert_eq!(cluster.state(), ClusterState::Stable);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_debounce_longer_than_timeout_never_stabilizes() {
    let fakes = FakeCluster::formed(2).await.unwrap();
    let manager = common::manager_for(&fakes);
    let mut cluster = manager.build_cloud(2).await.unwrap();

    // Every snapshot matches, but never for long enough
    let err = manager
        .stabilize(&mut cluster, Duration::from_millis(400), Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::ClusterFormation { .. }));
    assert_eq!(cluster.state(), ClusterState::Forming);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_build_fails_when_a_node_never_answers() {
    let fakes = FakeCluster::formed(2).await.unwrap();
    let mut endpoints = fakes.endpoints();
    endpoints.push(unused_endpoint().await.unwrap());

    let mut config = attach_config(endpoints);
    config.timeouts.startup = Duration::from_millis(500);
    let manager = ClusterManager::new(config).unwrap();

    let err = manager.build_cloud(3).await.unwrap_err();
    match err {
        HarnessError::ClusterFormation {
            expected,
            reason,
            observed,
        } => {
            assert_eq!(expected, 3);
            assert!(reason.contains("1 of 3"), "reason: {reason}");
            assert_eq!(observed.iter().filter(|o| o.error.is_some()).count(), 1);
        }
        other => panic!("expected ClusterFormation, got {other}"),
    }
}

#[tokio::test]
async fn test_build_rejects_bad_sizes() {
    let fakes = FakeCluster::formed(1).await.unwrap();
    let manager = common::manager_for(&fakes);

    assert!(matches!(
        manager.build_cloud(0).await,
        Err(HarnessError::InvalidInput { .. })
    ));
    // More nodes than configured endpoints
    assert!(matches!(
        manager.build_cloud(2).await,
        Err(HarnessError::ClusterFormation { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_node_degrades_stable_cluster() {
    let mut fakes = FakeCluster::formed(3).await.unwrap();
    let manager = common::manager_for(&fakes);
    let mut cluster = manager.build_cloud(3).await.unwrap();
    manager
        .stabilize(&mut cluster, Duration::from_secs(5), Duration::from_millis(200))
        .await
        .unwrap();

    let observed = manager.check_health(&mut cluster).await.unwrap();
    assert_eq!(observed.len(), 3);
    assert_eq!(cluster.state(), ClusterState::Stable);

    fakes.nodes[1].stop().await;
    let observed = manager.check_health(&mut cluster).await.unwrap();
    assert_eq!(cluster.state(), ClusterState::Degraded);
    assert!(observed[1].reported_size.is_none());

    manager.tear_down(&mut cluster).await;
    assert!(matches!(
        manager
            .stabilize(&mut cluster, Duration::from_secs(1), Duration::from_millis(100))
            .await,
        Err(HarnessError::ClusterFormation { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stabilize_can_be_cancelled() {
    let fakes = FakeCluster::start(2).await.unwrap();
    let manager = common::manager_for(&fakes);
    let mut cluster = manager.build_cloud(2).await.unwrap();

    let (handle, signal) = CancelSignal::new();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.cancel();
    });

    let started = Instant::now();
    let err = manager
        .stabilize_cancellable(
            &mut cluster,
            Duration::from_secs(30),
            Duration::from_millis(300),
            &signal,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Cancelled { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));

    // Best-effort teardown still runs after cancellation
    let report = manager.tear_down(&mut cluster).await;
    assert_eq!(report.nodes_shut_down, 2);
}

#[tokio::test]
async fn test_refused_shutdown_is_reported_not_raised() {
    let fakes = FakeCluster::formed(2).await.unwrap();
    fakes.node(1).fail_shutdown();

    let manager = common::manager_for(&fakes);
    let mut cluster = manager.build_cloud(2).await.unwrap();
    let report = manager.tear_down(&mut cluster).await;

    assert_eq!(report.nodes_shut_down, 1);
    let partial = report.partial_failure.unwrap();
    assert_eq!(partial.failures[0].0, fakes.node(1).endpoint());
    assert!(partial.to_string().starts_with("1 node(s) failed to shut down"));
}
