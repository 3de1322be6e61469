//! Data model shared by the node client, the cluster manager and the job registry.

use crate::error::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::time::Instant;

const MAX_KEY_LEN: usize = 512;

/// Opaque reference to data held by the cluster.
///
/// Keys are immutable once returned. The dataset behind a key may only become
/// visible on other nodes after propagation, see [`crate::settle`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key(String);

impl Key {
    /// Validate and wrap a key identifier
    pub fn new(raw: impl Into<String>) -> HarnessResult<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(HarnessError::InvalidInput {
                field: "key".to_string(),
                message: "key cannot be empty".to_string(),
            });
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(HarnessError::InvalidInput {
                field: "key".to_string(),
                message: format!("key longer than {} bytes", MAX_KEY_LEN),
            });
        }
        if let Some(c) = raw.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(HarnessError::InvalidInput {
                field: "key".to_string(),
                message: format!("key '{}' contains invalid character {:?}", raw, c),
            });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Key {
    type Error = HarnessError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Key::new(value)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.0
    }
}

/// Role of a node within the cluster it was built into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Coordinator,
    Member,
}

/// Lifecycle of a cluster as seen by the harness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterState {
    Forming,
    Stable,
    Degraded,
    TornDown,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterState::Forming => "forming",
            ClusterState::Stable => "stable",
            ClusterState::Degraded => "degraded",
            ClusterState::TornDown => "torn_down",
        };
        f.write_str(name)
    }
}

/// One member as listed by a node's membership view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MemberDescriptor {
    Named { name: String },
    Address(String),
}

impl MemberDescriptor {
    pub fn name(&self) -> &str {
        match self {
            MemberDescriptor::Named { name } => name,
            MemberDescriptor::Address(addr) => addr,
        }
    }
}

/// Response of `Cloud.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudStatus {
    #[serde(rename = "cloud_size")]
    pub reported_size: usize,
    #[serde(rename = "nodes", default)]
    pub members: Vec<MemberDescriptor>,
}

impl CloudStatus {
    pub fn member_addresses(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.name()).collect()
    }
}

/// Key plus resident size returned by an ingest call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub key: Key,
    pub size: u64,
}

/// What a server-side asynchronous job is doing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Parse { source: Key, destination: Key },
    Training { data: Key, requested_trees: u32 },
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Parse { .. } => "parse",
            JobKind::Training { .. } => "training",
        }
    }
}

/// Job status.
///
/// `TimedOut` is never reported by a server. It is the harness-side verdict
/// for a job whose wait expired while the server still had it in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Submitted,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Last progress figure observed for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum JobProgress {
    #[default]
    Unknown,
    /// Units completed vs. units requested (trees for training)
    Units { got: u64, total: u64 },
    /// Fraction in `[0, 1]` as reported by the progress endpoint
    Fraction(f64),
}

impl fmt::Display for JobProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobProgress::Unknown => f.write_str("no progress observed"),
            JobProgress::Units { got, total } => write!(f, "got={} total={}", got, total),
            JobProgress::Fraction(p) => write!(f, "progress={:.1}%", p * 100.0),
        }
    }
}

/// A server-side operation that completes independently of its request.
#[derive(Debug, Clone)]
pub struct AsyncJob {
    /// Address of the submitting node
    pub node: String,
    /// Server reference used to poll the job
    pub handle: String,
    pub kind: JobKind,
    /// Last status reported by the server (never `TimedOut`)
    pub server_status: JobStatus,
    pub progress: JobProgress,
    /// Key produced by a completed parse
    pub result: Option<Key>,
    /// Error text from a failed job
    pub error: Option<String>,
    /// When the harness accepted the submission
    pub submitted_at: Instant,
    abandoned: bool,
}

impl AsyncJob {
    pub fn new(node: impl Into<String>, handle: impl Into<String>, kind: JobKind) -> Self {
        Self {
            node: node.into(),
            handle: handle.into(),
            kind,
            server_status: JobStatus::Submitted,
            progress: JobProgress::Unknown,
            result: None,
            error: None,
            submitted_at: Instant::now(),
            abandoned: false,
        }
    }

    /// Harness verdict: server status, overlaid with `TimedOut` once abandoned
    pub fn status(&self) -> JobStatus {
        if self.abandoned && !self.server_status.is_terminal() {
            JobStatus::TimedOut
        } else {
            self.server_status
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.server_status.is_terminal()
    }

    /// Record that the harness stopped waiting. Does not touch server state.
    pub fn abandon(&mut self) {
        self.abandoned = true;
    }

    /// Fold a fresh poll result into this job
    pub(crate) fn apply(&mut self, update: JobUpdate) {
        self.server_status = update.status;
        self.progress = update.progress;
        if update.result.is_some() {
            self.result = update.result;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "{} job {} on {} [{}] {}",
            self.kind.name(),
            self.handle,
            self.node,
            self.status(),
            self.progress
        )
    }
}

/// Status fields re-read by a single poll
#[derive(Debug, Clone)]
pub(crate) struct JobUpdate {
    pub status: JobStatus,
    pub progress: JobProgress,
    pub result: Option<Key>,
    pub error: Option<String>,
}

/// Result of submitting a parse
#[derive(Debug, Clone)]
pub enum ParseOutcome {
    /// Parse finished; the key addresses the parsed dataset
    Ready(Key),
    /// Parse still running server-side
    Pending(AsyncJob),
}

impl ParseOutcome {
    pub fn key(&self) -> Option<&Key> {
        match self {
            ParseOutcome::Ready(key) => Some(key),
            ParseOutcome::Pending(_) => None,
        }
    }
}

/// Extra parameters forwarded verbatim to the training endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainOptions {
    pub model_key: Option<Key>,
    pub params: BTreeMap<String, String>,
}

impl TrainOptions {
    pub fn with_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn with_model_key(mut self, key: Key) -> Self {
        self.model_key = Some(key);
        self
    }
}
