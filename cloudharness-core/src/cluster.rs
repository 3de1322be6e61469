//! Cluster bring-up, quorum detection and teardown
//!
//! A [`Cluster`] is created Forming by [`ClusterManager::build_cloud`], moves
//! to Stable through [`ClusterManager::stabilize`], may drop to Degraded when
//! a health check finds an unreachable or disagreeing node, and ends TornDown.
//! Only the manager mutates cluster state.

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult, NodeObservation, PartialFailure};
use crate::launcher::{launcher_for, NodeLauncher, NodeProcess};
use crate::node::NodeHandle;
use crate::observability::cluster_span;
use crate::poller::{self, Backoff, CancelSignal, FnProbe, Observation, PollSpec, Probe, MIN_POLL_INTERVAL};
use crate::types::{ClusterState, NodeRole};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn, Instrument};

/// Ordered set of nodes under test
#[derive(Debug)]
pub struct Cluster {
    nodes: Vec<Arc<NodeHandle>>,
    expected_size: usize,
    state: ClusterState,
    last_observed: Vec<NodeObservation>,
    processes: Vec<NodeProcess>,
}

impl Cluster {
    pub fn nodes(&self) -> &[Arc<NodeHandle>] {
        &self.nodes
    }

    /// Node by position; node 0 is the coordinator
    pub fn node(&self, index: usize) -> Option<&Arc<NodeHandle>> {
        self.nodes.get(index)
    }

    pub fn coordinator(&self) -> Option<&Arc<NodeHandle>> {
        self.nodes.iter().find(|n| n.role() == NodeRole::Coordinator)
    }

    pub fn expected_size(&self) -> usize {
        self.expected_size
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Per-node sizes from the most recent membership round
    pub fn last_observed(&self) -> &[NodeObservation] {
        &self.last_observed
    }

    fn transition(&mut self, next: ClusterState) {
        if self.state != next {
            info!(from = %self.state, to = %next, nodes = self.nodes.len(), "Cluster state changed");
            self.state = next;
        }
    }
}

/// Summary of a teardown. Never an error.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub nodes_shut_down: usize,
    pub partial_failure: Option<PartialFailure>,
}

/// Builds, stabilizes and tears down clusters
pub struct ClusterManager {
    config: HarnessConfig,
    launcher: Box<dyn NodeLauncher>,
}

impl ClusterManager {
    /// Manager using the launcher the configuration asks for
    pub fn new(config: HarnessConfig) -> HarnessResult<Self> {
        let launcher = launcher_for(&config.cluster)?;
        Ok(Self { config, launcher })
    }

    pub fn with_launcher(config: HarnessConfig, launcher: Box<dyn NodeLauncher>) -> Self {
        Self { config, launcher }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Create or attach to `n` nodes and return a Forming cluster.
    ///
    /// Each node must answer a membership query at least once within the
    /// startup timeout; nodes that never do fail the build. Reaching quorum
    /// is left to [`stabilize`](Self::stabilize).
    pub async fn build_cloud(&self, n: usize) -> HarnessResult<Cluster> {
        let span = cluster_span("build_cloud", n);
        async move {
            if n == 0 {
                return Err(HarnessError::InvalidInput {
                    field: "n".to_string(),
                    message: "a cluster needs at least one node".to_string(),
                });
            }

            let launched = self.launcher.launch(n).await?;
            let timeouts = &self.config.timeouts;

            let mut nodes = Vec::with_capacity(n);
            for (index, endpoint) in launched.endpoints.iter().enumerate() {
                let role = if index == 0 {
                    NodeRole::Coordinator
                } else {
                    NodeRole::Member
                };
                nodes.push(Arc::new(NodeHandle::new(endpoint, role, timeouts.request)?));
            }

            info!(nodes = n, "Cluster forming, waiting for nodes to answer");
            let checks = nodes.iter().map(|node| {
                let spec = timeouts
                    .poll_spec(&format!("reach {}", node.address()), timeouts.startup)
                    .tolerate_errors(true);
                let node = node.clone();
                async move {
                    let mut probe = FnProbe::new(|| {
                        let node = node.clone();
                        async move {
                            let status = node.cloud_status().await?;
                            Ok::<_, HarnessError>(Ok::<_, String>(status))
                        }
                    });
                    let outcome = poller::wait_until(&mut probe, &spec).await;
                    (node, outcome)
                }
            });

            let mut observed = Vec::with_capacity(n);
            let mut unreachable = 0;
            for (node, outcome) in join_all(checks).await {
                match outcome {
                    Ok(status) => observed.push(NodeObservation {
                        address: node.address().to_string(),
                        reported_size: Some(status.reported_size),
                        error: None,
                    }),
                    Err(e) => {
                        unreachable += 1;
                        warn!(node = %node.address(), error = %e, "Node never became reachable");
                        observed.push(NodeObservation {
                            address: node.address().to_string(),
                            reported_size: None,
                            error: Some(e.to_string()),
                        });
                    }
                }
            }

            if unreachable > 0 {
                // Dropping `launched.processes` kills anything we started
                return Err(HarnessError::ClusterFormation {
                    expected: n,
                    reason: format!("{} of {} node(s) could not be reached", unreachable, n),
                    observed,
                });
            }

            Ok(Cluster {
                nodes,
                expected_size: n,
                state: ClusterState::Forming,
                last_observed: observed,
                processes: launched.processes,
            })
        }
        .instrument(span)
        .await
    }

    /// Wait until every node reports `cloud_size == expected` continuously
    /// for `debounce`, within `timeout`.
    pub async fn stabilize(
        &self,
        cluster: &mut Cluster,
        timeout: Duration,
        debounce: Duration,
    ) -> HarnessResult<()> {
        self.stabilize_cancellable(cluster, timeout, debounce, &CancelSignal::never())
            .await
    }

    pub async fn stabilize_cancellable(
        &self,
        cluster: &mut Cluster,
        timeout: Duration,
        debounce: Duration,
        cancel: &CancelSignal,
    ) -> HarnessResult<()> {
        let span = cluster_span("stabilize", cluster.expected_size);
        let result = self
            .await_quorum(cluster, timeout, debounce, cancel)
            .instrument(span.clone())
            .await;
        span.record("state", tracing::field::display(cluster.state));
        result
    }

    async fn await_quorum(
        &self,
        cluster: &mut Cluster,
        timeout: Duration,
        debounce: Duration,
        cancel: &CancelSignal,
    ) -> HarnessResult<()> {
        if cluster.state == ClusterState::TornDown {
            return Err(HarnessError::ClusterFormation {
                expected: cluster.expected_size,
                reason: "cluster has already been torn down".to_string(),
                observed: Vec::new(),
            });
        }

        // Sample several times inside one debounce window
        let interval = if debounce.is_zero() {
            self.config.timeouts.poll_interval
        } else {
            self.config.timeouts.poll_interval.min(debounce / 3)
        }
        .max(MIN_POLL_INTERVAL);
        let spec = PollSpec::new("stabilize", timeout, interval).with_backoff(Backoff::Fixed);

        let mut probe = QuorumProbe::new(&cluster.nodes, cluster.expected_size, debounce);
        let outcome = poller::wait_until_cancellable(&mut probe, &spec, cancel).await;
        let last = probe.into_observations();

        match outcome {
            Ok(observed) => {
                cluster.last_observed = observed;
                cluster.transition(ClusterState::Stable);
                Ok(())
            }
            Err(HarnessError::PollTimeout { elapsed, .. }) => {
                cluster.last_observed = last.clone();
                warn!(elapsed_ms = elapsed.as_millis() as u64, "Cluster did not stabilize");
                Err(HarnessError::ClusterFormation {
                    expected: cluster.expected_size,
                    reason: format!(
                        "membership did not hold for {:?} within {:?}",
                        debounce, timeout
                    ),
                    observed: last,
                })
            }
            Err(e) => {
                cluster.last_observed = last;
                Err(e)
            }
        }
    }

    /// One membership round. A Stable cluster with an unreachable or
    /// disagreeing node becomes Degraded.
    pub async fn check_health(&self, cluster: &mut Cluster) -> HarnessResult<Vec<NodeObservation>> {
        let observed = observe_round(&cluster.nodes).await?;
        let healthy = observed
            .iter()
            .all(|o| o.reported_size == Some(cluster.expected_size));

        if !healthy && cluster.state == ClusterState::Stable {
            for o in observed
                .iter()
                .filter(|o| o.reported_size != Some(cluster.expected_size))
            {
                warn!(node = %o.address, observed = %o, "Node lost membership");
            }
            cluster.transition(ClusterState::Degraded);
        }
        cluster.last_observed = observed.clone();
        Ok(observed)
    }

    /// Shut every node down and release launched processes.
    ///
    /// Per-node failures are collected into the report and logged; they are
    /// never raised. Calling this on a torn-down cluster does nothing.
    pub async fn tear_down(&self, cluster: &mut Cluster) -> TeardownReport {
        if cluster.state == ClusterState::TornDown {
            return TeardownReport::default();
        }
        let span = cluster_span("tear_down", cluster.expected_size);
        let grace = self.config.timeouts.shutdown_grace;
        let report = shut_down_all(cluster, grace).instrument(span.clone()).await;
        span.record("state", tracing::field::display(cluster.state));
        report
    }
}

async fn shut_down_all(cluster: &mut Cluster, grace: Duration) -> TeardownReport {
    let mut partial = PartialFailure::default();
    let results = join_all(cluster.nodes.iter().map(|node| async move {
        (node.address().to_string(), node.shutdown().await)
    }))
    .await;

    let mut nodes_shut_down = 0;
    for (address, result) in results {
        match result {
            Ok(()) => nodes_shut_down += 1,
            Err(e) => partial.record(address, e.to_string()),
        }
    }

    let stops = join_all(cluster.processes.iter_mut().map(|process| async move {
        (process.port, process.stop(grace).await)
    }))
    .await;
    for (port, result) in stops {
        if let Err(details) = result {
            partial.record(format!("process on port {}", port), details);
        }
    }

    cluster.transition(ClusterState::TornDown);

    let partial_failure = if partial.is_empty() {
        None
    } else {
        warn!(failure = %partial, "Teardown completed with failures");
        Some(partial)
    };

    TeardownReport {
        nodes_shut_down,
        partial_failure,
    }
}

/// Query every node once, concurrently. The round completes before it is
/// evaluated, so observations never mix rounds. An unreachable node is an
/// observation; a node answering with the wrong shape fails the round.
async fn observe_round(nodes: &[Arc<NodeHandle>]) -> HarnessResult<Vec<NodeObservation>> {
    join_all(nodes.iter().map(|node| async move {
        match node.cloud_status().await {
            Ok(status) => Ok(NodeObservation {
                address: node.address().to_string(),
                reported_size: Some(status.reported_size),
                error: None,
            }),
            Err(e) if e.is_connection() => Ok(NodeObservation {
                address: node.address().to_string(),
                reported_size: None,
                error: Some(e.to_string()),
            }),
            Err(e) => Err(e),
        }
    }))
    .await
    .into_iter()
    .collect()
}

/// Ready once every node has agreed on the expected size for `debounce`
struct QuorumProbe<'a> {
    nodes: &'a [Arc<NodeHandle>],
    expected: usize,
    debounce: Duration,
    agreed_since: Option<Instant>,
    last: Vec<NodeObservation>,
}

impl<'a> QuorumProbe<'a> {
    fn new(nodes: &'a [Arc<NodeHandle>], expected: usize, debounce: Duration) -> Self {
        Self {
            nodes,
            expected,
            debounce,
            agreed_since: None,
            last: Vec::new(),
        }
    }

    fn into_observations(self) -> Vec<NodeObservation> {
        self.last
    }
}

#[async_trait]
impl<'a> Probe for QuorumProbe<'a> {
    type Output = Vec<NodeObservation>;

    async fn observe(&mut self) -> HarnessResult<Observation<Vec<NodeObservation>>> {
        let observed = observe_round(self.nodes).await?;
        let agreed = observed.len() == self.expected
            && observed.iter().all(|o| o.reported_size == Some(self.expected));
        self.last = observed;

        if !agreed {
            if self.agreed_since.take().is_some() {
                info!("Membership changed inside the debounce window, restarting it");
            }
            return Ok(Observation::Pending);
        }

        let since = *self.agreed_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= self.debounce {
            Ok(Observation::Ready(self.last.clone()))
        } else {
            Ok(Observation::Pending)
        }
    }

    fn diagnostic(&self) -> String {
        let sizes = self
            .last
            .iter()
            .map(|o| o.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        match self.agreed_since {
            Some(since) => format!("agreed for {:?}: {}", since.elapsed(), sizes),
            None => format!("no agreement: {}", sizes),
        }
    }
}
