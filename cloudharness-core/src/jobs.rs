//! Registry of fire-and-forget jobs
//!
//! Jobs submitted without waiting are registered here so the suite can drain
//! them before the cluster goes away. Registration is keyed by job handle,
//! so registering the same job twice tracks it once.

use crate::error::{HarnessError, HarnessResult, PendingJob};
use crate::node::NodeHandle;
use crate::poller::{self, CancelSignal, Observation, PollSpec, Probe};
use crate::types::{AsyncJob, JobStatus};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_MAX_DRAIN_INTERVAL: Duration = Duration::from_secs(2);

/// Outcome of a successful drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub completed: usize,
    pub failed: usize,
}

/// Tracks jobs that nobody is currently waiting on
#[derive(Debug)]
pub struct JobRegistry {
    jobs: Mutex<BTreeMap<String, AsyncJob>>,
    interval: Duration,
    max_interval: Duration,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_DRAIN_INTERVAL, DEFAULT_MAX_DRAIN_INTERVAL)
    }

    /// Registry whose drain polls every `interval`, backing off to `max_interval`
    pub fn with_poll_interval(interval: Duration, max_interval: Duration) -> Self {
        Self {
            jobs: Mutex::new(BTreeMap::new()),
            interval,
            max_interval,
        }
    }

    /// Start tracking `job`. Returns false when its handle is already tracked.
    pub fn register(&self, job: AsyncJob) -> bool {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.handle) {
            debug!(job = %job.handle, "Job already registered");
            return false;
        }
        debug!(job = %job.handle, node = %job.node, kind = job.kind.name(), "Job registered");
        jobs.insert(job.handle.clone(), job);
        true
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    pub fn get(&self, handle: &str) -> Option<AsyncJob> {
        self.jobs.lock().get(handle).cloned()
    }

    /// Jobs not yet in a terminal state, in handle order
    pub fn pending(&self) -> Vec<AsyncJob> {
        self.jobs
            .lock()
            .values()
            .filter(|job| !job.is_terminal())
            .cloned()
            .collect()
    }

    /// Snapshot of every tracked job
    pub fn jobs(&self) -> Vec<AsyncJob> {
        self.jobs.lock().values().cloned().collect()
    }

    /// Wait for every registered job to finish.
    ///
    /// `nodes` resolves each job's submitting node. Failed jobs are terminal
    /// and counted in the summary; only jobs still running at the deadline
    /// make this fail with `Drain`.
    pub async fn drain(
        &self,
        nodes: &[Arc<NodeHandle>],
        timeout: Duration,
    ) -> HarnessResult<DrainSummary> {
        let spec = PollSpec::new("drain", timeout, self.interval).exponential(self.max_interval);
        self.drain_with(nodes, &spec, &CancelSignal::never()).await
    }

    pub async fn drain_with(
        &self,
        nodes: &[Arc<NodeHandle>],
        spec: &PollSpec,
        cancel: &CancelSignal,
    ) -> HarnessResult<DrainSummary> {
        let span = tracing::info_span!("drain", jobs = self.len());
        async move {
            info!(pending = self.pending().len(), "Drain started");

            let mut probe = DrainProbe {
                registry: self,
                nodes,
            };
            match poller::wait_until_cancellable(&mut probe, spec, cancel).await {
                Ok(()) => {
                    let summary = self.summary();
                    info!(completed = summary.completed, failed = summary.failed, "Drain finished");
                    Ok(summary)
                }
                Err(HarnessError::PollTimeout { elapsed, .. }) => {
                    let pending = self.abandon_pending();
                    warn!(
                        pending = pending.len(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Drain timed out"
                    );
                    Err(HarnessError::Drain { pending })
                }
                Err(e) => Err(e),
            }
        }
        .instrument(span)
        .await
    }

    fn summary(&self) -> DrainSummary {
        let jobs = self.jobs.lock();
        let mut summary = DrainSummary::default();
        for job in jobs.values() {
            match job.server_status {
                JobStatus::Completed => summary.completed += 1,
                JobStatus::Failed => {
                    summary.failed += 1;
                    warn!(
                        job = %job.handle,
                        error = job.error.as_deref().unwrap_or("unknown"),
                        "Drained job failed"
                    );
                }
                _ => {}
            }
        }
        summary
    }

    /// Mark every non-terminal job abandoned and describe it
    fn abandon_pending(&self) -> Vec<PendingJob> {
        let mut jobs = self.jobs.lock();
        jobs.values_mut()
            .filter(|job| !job.is_terminal())
            .map(|job| {
                job.abandon();
                PendingJob {
                    handle: job.handle.clone(),
                    node: job.node.clone(),
                    status: job.server_status.to_string(),
                    progress: job.progress.to_string(),
                }
            })
            .collect()
    }

    fn store(&self, updated: Vec<AsyncJob>) {
        let mut jobs = self.jobs.lock();
        for job in updated {
            jobs.insert(job.handle.clone(), job);
        }
    }
}

/// One round polls every pending job concurrently
struct DrainProbe<'a> {
    registry: &'a JobRegistry,
    nodes: &'a [Arc<NodeHandle>],
}

#[async_trait]
impl<'a> Probe for DrainProbe<'a> {
    type Output = ();

    async fn observe(&mut self) -> HarnessResult<Observation<()>> {
        let pending = self.registry.pending();
        if pending.is_empty() {
            return Ok(Observation::Ready(()));
        }

        let nodes = self.nodes;
        let polls = pending.iter().map(|job| async move {
            let node = nodes
                .iter()
                .find(|n| n.address() == job.node)
                .ok_or_else(|| HarnessError::InvalidInput {
                    field: "job.node".to_string(),
                    message: format!("job {} was submitted to unknown node {}", job.handle, job.node),
                })?;
            node.poll_job(job).await
        });

        let mut updated = Vec::with_capacity(pending.len());
        let mut first_error = None;
        for result in join_all(polls).await {
            match result {
                Ok(job) => updated.push(job),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        self.registry.store(updated);

        if let Some(e) = first_error {
            return Err(e);
        }
        if self.registry.pending().is_empty() {
            Ok(Observation::Ready(()))
        } else {
            Ok(Observation::Pending)
        }
    }

    fn diagnostic(&self) -> String {
        let pending = self.registry.pending();
        format!(
            "{} job(s) pending: {}",
            pending.len(),
            pending
                .iter()
                .map(|job| job.describe())
                .collect::<Vec<_>>()
                .join("; ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobKind, JobProgress, Key};
    use tracing_test::traced_test;

    fn training_job(handle: &str) -> AsyncJob {
        AsyncJob::new(
            "127.0.0.1:54321",
            handle,
            JobKind::Training {
                data: Key::new("covtype.hex").unwrap(),
                requested_trees: 50,
            },
        )
    }

    #[test]
    fn test_register_is_idempotent_on_handle() {
        let registry = JobRegistry::new();
        assert!(registry.register(training_job("model_1")));
        assert!(!registry.register(training_job("model_1")));
        assert!(registry.register(training_job("model_2")));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.pending().len(), 2);
    }

    #[test]
    #[traced_test]
    fn test_duplicate_registration_is_logged() {
        let registry = JobRegistry::new();
        registry.register(training_job("model_1"));
        registry.register(training_job("model_1"));
        assert!(logs_contain("Job registered"));
        assert!(logs_contain("Job already registered"));
    }

    #[tokio::test]
    async fn test_drain_of_empty_registry_is_immediate() {
        let registry = JobRegistry::new();
        let summary = registry.drain(&[], Duration::from_secs(1)).await.unwrap();
        assert_eq!(summary, DrainSummary::default());
    }

    #[tokio::test]
    async fn test_drain_counts_already_terminal_jobs() {
        let registry = JobRegistry::new();
        let mut done = training_job("model_done");
        done.server_status = JobStatus::Completed;
        let mut failed = training_job("model_failed");
        failed.server_status = JobStatus::Failed;
        failed.error = Some("bad column".to_string());
        registry.register(done);
        registry.register(failed);

        let summary = registry.drain(&[], Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            summary,
            DrainSummary {
                completed: 1,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_job_on_unknown_node_fails_fast() {
        let registry = JobRegistry::new();
        registry.register(training_job("model_orphan"));
        let err = registry
            .drain(&[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidInput { .. }));
    }

    #[test]
    fn test_abandon_pending_reports_progress() {
        let registry = JobRegistry::new();
        let mut job = training_job("model_slow");
        job.server_status = JobStatus::Running;
        job.progress = JobProgress::Units { got: 120, total: 137 };
        registry.register(job);

        let pending = registry.abandon_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].progress, "got=120 total=137");
        assert_eq!(
            registry.get("model_slow").unwrap().status(),
            JobStatus::TimedOut
        );
    }
}
