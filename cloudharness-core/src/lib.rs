pub mod cluster;
pub mod config;
pub mod error;
pub mod jobs;
pub mod launcher;
pub mod node;
pub mod observability;
pub mod poller;
pub mod settle;
pub mod suite;
pub mod types;

// Fake cluster nodes for integration tests
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use cluster::{Cluster, ClusterManager, TeardownReport};
pub use config::HarnessConfig;
pub use error::{HarnessError, HarnessResult, NodeObservation, PartialFailure, PendingJob};
pub use jobs::{DrainSummary, JobRegistry};
pub use node::NodeHandle;
pub use poller::{wait_until, wait_until_cancellable, CancelHandle, CancelSignal, PollSpec, Probe};
pub use settle::settle_key;
pub use suite::{SandboxOracle, Suite, SuiteContext};
pub use types::{AsyncJob, ClusterState, JobKind, JobProgress, JobStatus, Key, ParseOutcome};
