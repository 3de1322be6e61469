use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// What a single node reported during a membership round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeObservation {
    pub address: String,
    /// `None` when the node could not be reached in that round
    pub reported_size: Option<usize>,
    pub error: Option<String>,
}

impl fmt::Display for NodeObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.reported_size, &self.error) {
            (Some(size), _) => write!(f, "{} reportedSize={}", self.address, size),
            (None, Some(err)) => write!(f, "{} unreachable ({})", self.address, err),
            (None, None) => write!(f, "{} not observed", self.address),
        }
    }
}

/// Last known state of a job that did not reach a terminal status in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJob {
    pub handle: String,
    pub node: String,
    pub status: String,
    pub progress: String,
}

impl fmt::Display for PendingJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} [{}] {}",
            self.handle, self.node, self.status, self.progress
        )
    }
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Connection error to {address}: {details}")]
    Connection { address: String, details: String },

    #[error("Protocol error in '{operation}': {details}")]
    Protocol { operation: String, details: String },

    #[error(
        "Cluster formation failed (expected {expected} nodes): {reason}; observed: [{}]",
        join_display(.observed)
    )]
    ClusterFormation {
        expected: usize,
        reason: String,
        observed: Vec<NodeObservation>,
    },

    #[error("Job {job} did not complete within {elapsed:?}: {progress}")]
    JobTimeout {
        job: String,
        elapsed: Duration,
        progress: String,
    },

    #[error("Job {job} failed: {message}")]
    JobFailed { job: String, message: String },

    #[error("Operation timed out: {operation} after {elapsed:?} (last observation: {last_observation})")]
    PollTimeout {
        operation: String,
        elapsed: Duration,
        last_observation: String,
    },

    #[error("{} job(s) still in flight at drain: [{}]", .pending.len(), join_display(.pending))]
    Drain { pending: Vec<PendingJob> },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Server rejected '{operation}': {message}")]
    Rejected { operation: String, message: String },

    #[error("Invalid input for {field}: {message}")]
    InvalidInput { field: String, message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Sandbox check failed: {message}")]
    Sandbox { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

impl HarnessError {
    /// Transport-level failure, as opposed to a bad or unexpected response.
    pub fn is_connection(&self) -> bool {
        matches!(self, HarnessError::Connection { .. })
    }

    pub(crate) fn protocol(operation: &str, details: impl Into<String>) -> Self {
        HarnessError::Protocol {
            operation: operation.to_string(),
            details: details.into(),
        }
    }
}

/// One or more nodes failed to shut down cleanly.
///
/// Returned and logged by teardown, never raised: a teardown problem must not
/// replace an earlier test failure as the reported cause.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialFailure {
    pub failures: Vec<(String, String)>,
}

impl PartialFailure {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn record(&mut self, address: impl Into<String>, details: impl Into<String>) {
        self.failures.push((address.into(), details.into()));
    }
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} node(s) failed to shut down:", self.failures.len())?;
        for (address, details) in &self.failures {
            write!(f, " {} ({});", address, details)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formation_error_lists_observed_sizes() {
        let err = HarnessError::ClusterFormation {
            expected: 3,
            reason: "quorum not reached".to_string(),
            observed: vec![
                NodeObservation {
                    address: "127.0.0.1:54321".to_string(),
                    reported_size: Some(2),
                    error: None,
                },
                NodeObservation {
                    address: "127.0.0.1:54324".to_string(),
                    reported_size: None,
                    error: Some("connection refused".to_string()),
                },
            ],
        };

        let msg = err.to_string();
        assert!(msg.contains("expected 3 nodes"));
        assert!(msg.contains("127.0.0.1:54321 reportedSize=2"));
        assert!(msg.contains("127.0.0.1:54324 unreachable (connection refused)"));
    }

    #[test]
    fn test_drain_error_counts_pending() {
        let err = HarnessError::Drain {
            pending: vec![PendingJob {
                handle: "rf_1".to_string(),
                node: "127.0.0.1:54321".to_string(),
                status: "Running".to_string(),
                progress: "got=120 total=137".to_string(),
            }],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("1 job(s) still in flight"));
        assert!(msg.contains("got=120 total=137"));
    }

    #[test]
    fn test_partial_failure_display() {
        let mut partial = PartialFailure::default();
        assert!(partial.is_empty());
        partial.record("127.0.0.1:54321", "connection reset");
        assert!(!partial.is_empty());
        assert_eq!(
            partial.to_string(),
            "1 node(s) failed to shut down: 127.0.0.1:54321 (connection reset);"
        );
    }
}
