//! Per-suite fixture owning one cluster for the suite's lifetime
//!
//! ```no_run
//! # async fn run() -> cloudharness_core::HarnessResult<()> {
//! use cloudharness_core::{HarnessConfig, Suite};
//!
//! let suite = Suite::setup(HarnessConfig::from_file("harness.toml")?).await?;
//! let ctx = suite.context();
//! let outcome = async {
//!     let status = ctx.coordinator()?.cloud_status().await?;
//!     assert_eq!(status.reported_size, ctx.nodes().len());
//!     Ok::<(), cloudharness_core::HarnessError>(())
//! }
//! .await;
//! suite.finish(outcome).await
//! # }
//! ```

use crate::cluster::{Cluster, ClusterManager, TeardownReport};
use crate::config::{HarnessConfig, TimeoutConfig};
use crate::error::{HarnessError, HarnessResult};
use crate::jobs::{DrainSummary, JobRegistry};
use crate::node::NodeHandle;
use crate::poller::{CancelSignal, PollSpec};
use crate::settle::settle_key;
use crate::types::{AsyncJob, Key};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Pass/fail check over server-side logs, run when a suite finishes
pub trait SandboxOracle: Send + Sync {
    fn check(&self) -> Result<(), String>;
}

impl<F> SandboxOracle for F
where
    F: Fn() -> Result<(), String> + Send + Sync,
{
    fn check(&self) -> Result<(), String> {
        self()
    }
}

/// A stabilized cluster plus the job registry draining into it
pub struct Suite {
    manager: ClusterManager,
    cluster: Cluster,
    jobs: Arc<JobRegistry>,
    oracle: Option<Box<dyn SandboxOracle>>,
}

impl Suite {
    /// Build and stabilize `config.cluster.node_count` nodes
    pub async fn setup(config: HarnessConfig) -> HarnessResult<Self> {
        Self::setup_with(ClusterManager::new(config)?).await
    }

    /// Set up with a caller-provided manager. A cluster that fails to
    /// stabilize is torn down before the error is returned.
    pub async fn setup_with(manager: ClusterManager) -> HarnessResult<Self> {
        let count = manager.config().cluster.node_count;
        let timeouts = manager.config().timeouts.clone();

        let mut cluster = manager.build_cloud(count).await?;
        if let Err(e) = manager
            .stabilize(&mut cluster, timeouts.stabilize, timeouts.debounce)
            .await
        {
            let report = manager.tear_down(&mut cluster).await;
            log_teardown(&report);
            return Err(e);
        }

        let jobs = JobRegistry::with_poll_interval(timeouts.poll_interval, timeouts.max_poll_interval);
        info!(nodes = cluster.len(), "Suite ready");
        Ok(Self {
            manager,
            cluster,
            jobs: Arc::new(jobs),
            oracle: None,
        })
    }

    pub fn with_oracle(mut self, oracle: impl SandboxOracle + 'static) -> Self {
        self.oracle = Some(Box::new(oracle));
        self
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn manager(&self) -> &ClusterManager {
        &self.manager
    }

    /// Handle passed to individual test cases
    pub fn context(&self) -> SuiteContext {
        SuiteContext {
            nodes: self.cluster.nodes().to_vec(),
            jobs: self.jobs.clone(),
            timeouts: self.manager.config().timeouts.clone(),
        }
    }

    /// Drain outstanding jobs, tear the cluster down and run the oracle.
    ///
    /// A failed `outcome` is returned unchanged; drain, oracle and teardown
    /// problems are then only logged. A successful outcome is turned into the
    /// first drain or oracle failure.
    pub async fn finish<T>(mut self, outcome: HarnessResult<T>) -> HarnessResult<T> {
        let drain = self
            .jobs
            .drain(self.cluster.nodes(), self.manager.config().timeouts.drain)
            .await;
        let report = self.manager.tear_down(&mut self.cluster).await;
        log_teardown(&report);

        let oracle = match &self.oracle {
            Some(oracle) => oracle
                .check()
                .map_err(|message| HarnessError::Sandbox { message }),
            None => Ok(()),
        };

        match outcome {
            Err(primary) => {
                if let Err(e) = &drain {
                    warn!(error = %e, "Drain failed after a test failure");
                }
                if let Err(e) = &oracle {
                    warn!(error = %e, "Sandbox check failed after a test failure");
                }
                error!(error = %primary, "Suite failed");
                Err(primary)
            }
            Ok(value) => {
                let summary: DrainSummary = drain?;
                oracle?;
                info!(completed = summary.completed, failed = summary.failed, "Suite finished");
                Ok(value)
            }
        }
    }
}

fn log_teardown(report: &TeardownReport) {
    match &report.partial_failure {
        Some(partial) => warn!(nodes = report.nodes_shut_down, failure = %partial, "Teardown incomplete"),
        None => info!(nodes = report.nodes_shut_down, "Teardown complete"),
    }
}

/// What a test case gets: node handles, the shared registry and timeouts
#[derive(Clone)]
pub struct SuiteContext {
    nodes: Vec<Arc<NodeHandle>>,
    jobs: Arc<JobRegistry>,
    timeouts: TimeoutConfig,
}

impl SuiteContext {
    pub fn nodes(&self) -> &[Arc<NodeHandle>] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> HarnessResult<&Arc<NodeHandle>> {
        self.nodes.get(index).ok_or_else(|| HarnessError::InvalidInput {
            field: "index".to_string(),
            message: format!("cluster has {} node(s), no node {}", self.nodes.len(), index),
        })
    }

    pub fn coordinator(&self) -> HarnessResult<&Arc<NodeHandle>> {
        self.node(0)
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// Hand a fire-and-forget job to the suite's registry
    pub fn track(&self, job: AsyncJob) -> bool {
        self.jobs.register(job)
    }

    /// Poll spec for a job wait using the configured job timeout
    pub fn job_spec(&self, operation: &str) -> PollSpec {
        self.timeouts.poll_spec(operation, self.timeouts.job)
    }

    /// Wait for `job` on the node that accepted it
    pub async fn wait_for_job(&self, job: AsyncJob) -> HarnessResult<AsyncJob> {
        let node = self
            .nodes
            .iter()
            .find(|n| n.address() == job.node)
            .ok_or_else(|| HarnessError::InvalidInput {
                field: "job.node".to_string(),
                message: format!("job {} was submitted to unknown node {}", job.handle, job.node),
            })?;
        let spec = self.job_spec(&format!("{} {}", job.kind.name(), job.handle));
        node.wait_for_job(job, &spec, &CancelSignal::never()).await
    }

    /// Wait until `key` is visible on every node
    pub async fn settle(&self, key: &Key) -> HarnessResult<()> {
        let spec = self.timeouts.poll_spec(&format!("settle {}", key), self.timeouts.settle);
        settle_key(&self.nodes, key, &spec).await
    }
}
