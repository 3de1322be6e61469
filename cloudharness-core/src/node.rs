//! Client-side handle to one cluster member
//!
//! `NodeHandle` is the only place that talks to the network. It turns calls
//! into JSON-over-HTTP requests and maps responses onto the data model.
//! Transport failures become `Connection` errors, responses of the wrong
//! shape become `Protocol` errors. A job that reports failure is not an
//! error here; it is a legitimate [`JobStatus::Failed`].

use crate::error::{HarnessError, HarnessResult};
use crate::observability::{job_span, node_span};
use crate::poller::{self, CancelSignal, Observation, PollSpec, Probe, MIN_POLL_INTERVAL};
use crate::types::{
    AsyncJob, CloudStatus, JobKind, JobProgress, JobStatus, JobUpdate, Key, NodeRole,
    ParseOutcome, PutResult, TrainOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};
use url::Url;

const POLL_OPERATION: &str = "poll_job";

/// Endpoint paths served by every cluster node
pub mod paths {
    pub const PUT_FILE: &str = "PutFile.json";
    pub const PUT_VALUE: &str = "PutValue.json";
    pub const PARSE: &str = "Parse.json";
    pub const PROGRESS: &str = "Progress.json";
    pub const TRAIN: &str = "RF.json";
    pub const TRAIN_VIEW: &str = "RFView.json";
    pub const CLOUD: &str = "Cloud.json";
    pub const STORE_VIEW: &str = "StoreView.json";
    pub const GET: &str = "Get.json";
    pub const SHUTDOWN: &str = "Shutdown.json";
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    #[serde(rename = "keyHref")]
    key_href: String,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct ParseResponse {
    #[serde(rename = "jobHref")]
    job_href: Option<String>,
    #[serde(rename = "keyHref")]
    key_href: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProgressResponse {
    status: Option<String>,
    progress: Option<f64>,
    #[serde(rename = "keyHref")]
    key_href: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TrainResponse {
    #[serde(rename = "confKeyHref")]
    conf_key_href: String,
}

#[derive(Debug, Deserialize)]
struct TrainViewResponse {
    got: Option<u64>,
    total: Option<u64>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoreEntry {
    Keyed { key: String },
    Plain(String),
}

#[derive(Debug, Deserialize)]
struct StoreViewResponse {
    keys: Vec<StoreEntry>,
}

/// Handle to one cluster member
#[derive(Debug, Clone)]
pub struct NodeHandle {
    address: String,
    base: Url,
    role: NodeRole,
    client: reqwest::Client,
}

impl NodeHandle {
    /// Create a handle for `endpoint` (`host:port` or an http(s) URL)
    pub fn new(endpoint: &str, role: NodeRole, request_timeout: Duration) -> HarnessResult<Self> {
        let raw = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("http://{}", endpoint)
        };
        let mut base = Url::parse(&raw).map_err(|e| HarnessError::InvalidInput {
            field: "endpoint".to_string(),
            message: format!("'{}': {}", endpoint, e),
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let address = match (base.host_str(), base.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            _ => {
                return Err(HarnessError::InvalidInput {
                    field: "endpoint".to_string(),
                    message: format!("'{}' has no host", endpoint),
                })
            }
        };

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| HarnessError::Configuration {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            address,
            base,
            role,
            client,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Upload a local file. The data is resident on this node once this
    /// returns; other nodes may not see it until it settles.
    pub async fn put_file(
        &self,
        path: impl AsRef<Path>,
        key: Option<&Key>,
        replication: Option<u32>,
    ) -> HarnessResult<PutResult> {
        let path = path.as_ref();
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| HarnessError::InvalidInput {
                field: "path".to_string(),
                message: format!("cannot read {:?}: {}", path, e),
            })?;

        let query = ingest_query(key, replication);
        let value = self
            .request("put_file", reqwest::Method::POST, paths::PUT_FILE, &query, Some(body))
            .await?;
        let put: PutResponse = decode("put_file", value)?;
        let key = response_key("put_file", put.key_href)?;
        debug!(node = %self.address, key = %key, size = put.size, "File ingested");
        Ok(PutResult {
            key,
            size: put.size,
        })
    }

    /// Store an in-memory value under a key
    pub async fn put_key(
        &self,
        value: &str,
        key: Option<&Key>,
        replication: Option<u32>,
    ) -> HarnessResult<PutResult> {
        let mut query = ingest_query(key, replication);
        query.push(("value", value.to_string()));
        let value = self
            .request("put_key", reqwest::Method::GET, paths::PUT_VALUE, &query, None)
            .await?;
        let put: PutResponse = decode("put_key", value)?;
        let key = response_key("put_key", put.key_href)?;
        debug!(node = %self.address, key = %key, size = put.size, "Value stored");
        Ok(PutResult {
            key,
            size: put.size,
        })
    }

    /// Parse `source` into `destination`.
    ///
    /// With `poll` the call waits (checking every `retry_delay`) until the
    /// parse finishes and returns its key, or fails with `JobTimeout` after
    /// `timeout`. Without `poll` a running parse comes back as
    /// [`ParseOutcome::Pending`]; the caller owns the returned job.
    pub async fn parse(
        &self,
        source: &Key,
        destination: &Key,
        timeout: Duration,
        retry_delay: Duration,
        poll: bool,
    ) -> HarnessResult<ParseOutcome> {
        let query = [
            ("source_key", source.to_string()),
            ("destination_key", destination.to_string()),
        ];
        let value = self
            .request("parse", reqwest::Method::GET, paths::PARSE, &query, None)
            .await?;
        let response: ParseResponse = decode("parse", value)?;

        let job = match (response.job_href, response.key_href) {
            (Some(handle), _) => AsyncJob::new(
                self.address.clone(),
                handle,
                JobKind::Parse {
                    source: source.clone(),
                    destination: destination.clone(),
                },
            ),
            (None, Some(key)) => return Ok(ParseOutcome::Ready(response_key("parse", key)?)),
            (None, None) => {
                return Err(HarnessError::protocol(
                    "parse",
                    "response carries neither jobHref nor keyHref",
                ))
            }
        };
        info!(node = %self.address, job = %job.handle, kind = "parse", destination = %destination, "Job submitted");

        if !poll {
            return Ok(ParseOutcome::Pending(job));
        }

        let interval = retry_delay.max(MIN_POLL_INTERVAL);
        let spec = PollSpec::new(format!("parse {}", destination), timeout, interval);
        let job = self.wait_for_job(job, &spec, &CancelSignal::never()).await?;
        match job.server_status {
            JobStatus::Completed => Ok(ParseOutcome::Ready(
                job.result.unwrap_or_else(|| destination.clone()),
            )),
            _ => Err(HarnessError::JobFailed {
                job: job.handle,
                message: job.error.unwrap_or_else(|| "parse failed".to_string()),
            }),
        }
    }

    /// Submit a training job. Never blocks on completion.
    pub async fn train_ensemble(
        &self,
        data: &Key,
        tree_count: u32,
        depth: u32,
        options: &TrainOptions,
    ) -> HarnessResult<AsyncJob> {
        let mut query = vec![
            ("data_key", data.to_string()),
            ("ntree", tree_count.to_string()),
            ("depth", depth.to_string()),
        ];
        if let Some(model_key) = &options.model_key {
            query.push(("model_key", model_key.to_string()));
        }
        for (name, value) in &options.params {
            query.push((name.as_str(), value.clone()));
        }

        let value = self
            .request("train_ensemble", reqwest::Method::GET, paths::TRAIN, &query, None)
            .await?;
        let response: TrainResponse = decode("train_ensemble", value)?;
        let job = AsyncJob::new(
            self.address.clone(),
            response.conf_key_href,
            JobKind::Training {
                data: data.clone(),
                requested_trees: tree_count,
            },
        );
        info!(node = %self.address, job = %job.handle, kind = "training", trees = tree_count, "Job submitted");
        Ok(job)
    }

    /// Re-read a job's status and progress once. Does not sleep.
    pub async fn poll_job(&self, job: &AsyncJob) -> HarnessResult<AsyncJob> {
        let update = match &job.kind {
            JobKind::Parse { destination, .. } => {
                let query = [
                    ("job", job.handle.clone()),
                    ("dest_key", destination.to_string()),
                ];
                let value = self
                    .request(POLL_OPERATION, reqwest::Method::GET, paths::PROGRESS, &query, None)
                    .await?;
                let progress: ProgressResponse = decode(POLL_OPERATION, value)?;
                parse_update(progress)?
            }
            JobKind::Training {
                data,
                requested_trees,
            } => {
                let query = [
                    ("model_key", job.handle.clone()),
                    ("data_key", data.to_string()),
                ];
                let value = self
                    .request(POLL_OPERATION, reqwest::Method::GET, paths::TRAIN_VIEW, &query, None)
                    .await?;
                let view: TrainViewResponse = decode(POLL_OPERATION, value)?;
                training_update(view, u64::from(*requested_trees))?
            }
        };

        let was_terminal = job.is_terminal();
        let mut updated = job.clone();
        updated.apply(update);
        debug!(job = %updated.handle, status = %updated.server_status, progress = %updated.progress, "Job polled");
        if updated.is_terminal() && !was_terminal {
            info!(
                job = %updated.handle,
                status = %updated.server_status,
                progress = %updated.progress,
                age_ms = updated.submitted_at.elapsed().as_millis() as u64,
                "Job terminal"
            );
        }
        Ok(updated)
    }

    /// Poll `job` until it reaches a terminal status.
    ///
    /// Returns the job in its terminal state (Completed or Failed). When the
    /// deadline passes first, the job is abandoned and `JobTimeout` carries
    /// its last progress; the server may keep running it.
    pub async fn wait_for_job(
        &self,
        job: AsyncJob,
        spec: &PollSpec,
        cancel: &CancelSignal,
    ) -> HarnessResult<AsyncJob> {
        let span = job_span(job.kind.name(), &job.handle);
        let mut probe = JobProbe::new(self, job);
        let outcome = poller::wait_until_cancellable(&mut probe, spec, cancel)
            .instrument(span.clone())
            .await;

        match outcome {
            Ok(job) => {
                span.record("status", tracing::field::display(job.server_status));
                Ok(job)
            }
            Err(HarnessError::PollTimeout { elapsed, .. }) => {
                let mut job = probe.into_job();
                job.abandon();
                span.record("status", tracing::field::display(job.status()));
                warn!(
                    job = %job.handle,
                    node = %job.node,
                    progress = %job.progress,
                    "Job abandoned after timeout; it may still be running on the server"
                );
                Err(HarnessError::JobTimeout {
                    job: job.handle,
                    elapsed,
                    progress: job.progress.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Current membership view of this node
    pub async fn cloud_status(&self) -> HarnessResult<CloudStatus> {
        let value = self
            .request("cloud_status", reqwest::Method::GET, paths::CLOUD, &[], None)
            .await?;
        decode("cloud_status", value)
    }

    /// Keys known to this node
    pub async fn store_view(&self) -> HarnessResult<Vec<String>> {
        let value = self
            .request("store_view", reqwest::Method::GET, paths::STORE_VIEW, &[], None)
            .await?;
        let view: StoreViewResponse = decode("store_view", value)?;
        Ok(view
            .keys
            .into_iter()
            .map(|entry| match entry {
                StoreEntry::Keyed { key } => key,
                StoreEntry::Plain(key) => key,
            })
            .collect())
    }

    /// Raw bytes stored under `key`
    pub async fn get_key(&self, key: &Key) -> HarnessResult<Bytes> {
        let url = self.url_for(paths::GET)?;
        let response = self
            .client
            .get(url)
            .query(&[("key", key.as_str())])
            .send()
            .instrument(node_span("get_key", &self.address))
            .await
            .map_err(|e| self.transport_error(e))?;
        if !response.status().is_success() {
            return Err(HarnessError::protocol(
                "get_key",
                format!("HTTP {} for key {}", response.status(), key),
            ));
        }
        response.bytes().await.map_err(|e| self.transport_error(e))
    }

    /// Ask the node to exit
    pub async fn shutdown(&self) -> HarnessResult<()> {
        self.request("shutdown", reqwest::Method::GET, paths::SHUTDOWN, &[], None)
            .await
            .map(|_| ())
    }

    fn url_for(&self, path: &str) -> HarnessResult<Url> {
        self.base
            .join(path)
            .map_err(|e| HarnessError::protocol(path, format!("bad endpoint url: {}", e)))
    }

    fn transport_error(&self, error: reqwest::Error) -> HarnessError {
        HarnessError::Connection {
            address: self.address.clone(),
            details: error.to_string(),
        }
    }

    async fn request(
        &self,
        operation: &str,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Vec<u8>>,
    ) -> HarnessResult<serde_json::Value> {
        let span = node_span(operation, &self.address);
        let url = self.url_for(path)?;

        let mut request = self.client.request(method, url).query(query);
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request
            .send()
            .instrument(span.clone())
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = response.status();
        span.record("status", status.as_u16());
        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;

        let value: Option<serde_json::Value> = serde_json::from_slice(&body).ok();
        if let Some(message) = value.as_ref().and_then(error_field) {
            // A poll's error body describes the job, not the request
            if operation == POLL_OPERATION {
                debug!(node = %self.address, http_status = status.as_u16(), error = %message, "Job reported an error");
                return value.ok_or_else(|| HarnessError::protocol(operation, "response body is not JSON"));
            }
            return Err(HarnessError::Rejected {
                operation: operation.to_string(),
                message,
            });
        }
        if !status.is_success() {
            return Err(HarnessError::protocol(
                operation,
                format!("HTTP {}: {}", status, String::from_utf8_lossy(&body)),
            ));
        }
        value.ok_or_else(|| HarnessError::protocol(operation, "response body is not JSON"))
    }
}

fn ingest_query(key: Option<&Key>, replication: Option<u32>) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(key) = key {
        query.push(("key", key.to_string()));
    }
    if let Some(rf) = replication {
        query.push(("rf", rf.to_string()));
    }
    query
}

fn error_field(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|e| e.as_str())
        .map(|e| e.to_string())
}

fn decode<T: DeserializeOwned>(operation: &str, value: serde_json::Value) -> HarnessResult<T> {
    serde_json::from_value(value).map_err(|e| HarnessError::protocol(operation, e.to_string()))
}

fn response_key(operation: &str, raw: String) -> HarnessResult<Key> {
    Key::new(raw).map_err(|e| HarnessError::protocol(operation, e.to_string()))
}

fn parse_update(progress: ProgressResponse) -> HarnessResult<JobUpdate> {
    let fraction = progress.progress.map(|p| p.clamp(0.0, 1.0));
    if let Some(error) = progress.error {
        return Ok(JobUpdate {
            status: JobStatus::Failed,
            progress: fraction.map(JobProgress::Fraction).unwrap_or_default(),
            result: None,
            error: Some(error),
        });
    }

    let result = progress
        .key_href
        .map(|key| response_key(POLL_OPERATION, key))
        .transpose()?;
    let Some(raw_status) = progress.status else {
        return Err(HarnessError::protocol(
            POLL_OPERATION,
            "progress response carries neither status nor error",
        ));
    };
    let status = match raw_status.as_str() {
        "done" => JobStatus::Completed,
        "error" => JobStatus::Failed,
        "poll" if fraction.unwrap_or(0.0) > 0.0 => JobStatus::Running,
        "poll" => JobStatus::Submitted,
        other => {
            return Err(HarnessError::protocol(
                POLL_OPERATION,
                format!("unknown progress status '{}'", other),
            ))
        }
    };
    let progress = match (status, fraction) {
        (JobStatus::Completed, _) => JobProgress::Fraction(1.0),
        (_, Some(p)) => JobProgress::Fraction(p),
        (_, None) => JobProgress::Unknown,
    };
    Ok(JobUpdate {
        status,
        progress,
        result,
        error: None,
    })
}

/// Map a training view onto a job update.
///
/// Completion needs every requested tree: a server that has not yet set the
/// job up may report a `total` smaller than the request, and `got == total`
/// alone would then read as done.
fn training_update(view: TrainViewResponse, requested: u64) -> HarnessResult<JobUpdate> {
    let progress = match (view.got, view.total) {
        (Some(got), Some(total)) => JobProgress::Units { got, total },
        _ => JobProgress::Unknown,
    };
    if let Some(error) = view.error {
        return Ok(JobUpdate {
            status: JobStatus::Failed,
            progress,
            result: None,
            error: Some(error),
        });
    }

    let (Some(got), Some(total)) = (view.got, view.total) else {
        return Err(HarnessError::protocol(
            POLL_OPERATION,
            "training view carries neither got/total nor error",
        ));
    };
    if got > total || total > requested {
        return Err(HarnessError::protocol(
            POLL_OPERATION,
            format!("got={} total={} for {} requested trees", got, total, requested),
        ));
    }
    let status = if got == total && total == requested {
        JobStatus::Completed
    } else if got > 0 {
        JobStatus::Running
    } else {
        JobStatus::Submitted
    };
    Ok(JobUpdate {
        status,
        progress,
        result: None,
        error: None,
    })
}

/// Ready once the job reaches a terminal status
pub struct JobProbe<'a> {
    node: &'a NodeHandle,
    job: AsyncJob,
}

impl<'a> JobProbe<'a> {
    pub fn new(node: &'a NodeHandle, job: AsyncJob) -> Self {
        Self { node, job }
    }

    pub fn into_job(self) -> AsyncJob {
        self.job
    }
}

#[async_trait]
impl<'a> Probe for JobProbe<'a> {
    type Output = AsyncJob;

    async fn observe(&mut self) -> HarnessResult<Observation<AsyncJob>> {
        self.job = self.node.poll_job(&self.job).await?;
        if self.job.is_terminal() {
            Ok(Observation::Ready(self.job.clone()))
        } else {
            Ok(Observation::Pending)
        }
    }

    fn diagnostic(&self) -> String {
        self.job.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalisation() {
        let node = NodeHandle::new("127.0.0.1:54321", NodeRole::Coordinator, Duration::from_secs(1))
            .unwrap();
        assert_eq!(node.address(), "127.0.0.1:54321");
        assert_eq!(
            node.url_for(paths::CLOUD).unwrap().as_str(),
            "http://127.0.0.1:54321/Cloud.json"
        );

        let prefixed = NodeHandle::new(
            "http://10.0.0.7:8080/api",
            NodeRole::Member,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(prefixed.address(), "10.0.0.7:8080");
        assert_eq!(
            prefixed.url_for(paths::CLOUD).unwrap().as_str(),
            "http://10.0.0.7:8080/api/Cloud.json"
        );

        assert!(NodeHandle::new("http://", NodeRole::Member, Duration::from_secs(1)).is_err());
    }

    fn view(got: u64, total: u64) -> TrainViewResponse {
        TrainViewResponse {
            got: Some(got),
            total: Some(total),
            error: None,
        }
    }

    fn progress(status: &str, fraction: Option<f64>) -> ProgressResponse {
        ProgressResponse {
            status: Some(status.to_string()),
            progress: fraction,
            key_href: None,
            error: None,
        }
    }

    #[test]
    fn test_training_progress_never_completes_early() {
        let update = training_update(view(120, 137), 137).unwrap();
        assert_eq!(update.status, JobStatus::Running);

        let update = training_update(view(137, 137), 137).unwrap();
        assert_eq!(update.status, JobStatus::Completed);

        let update = training_update(view(0, 137), 137).unwrap();
        assert_eq!(update.status, JobStatus::Submitted);

        assert!(training_update(view(140, 137), 137).is_err());
    }

    #[test]
    fn test_training_total_must_reach_requested_trees() {
        // Job not set up yet: nothing built, nothing planned
        let update = training_update(view(0, 0), 137).unwrap();
        assert_eq!(update.status, JobStatus::Submitted);

        let update = training_update(view(40, 40), 137).unwrap();
        assert_eq!(update.status, JobStatus::Running);

        let err = training_update(view(10, 200), 137).unwrap_err();
        assert!(matches!(err, HarnessError::Protocol { .. }));
    }

    #[test]
    fn test_training_error_is_a_failed_job_not_an_error() {
        let update = training_update(
            TrainViewResponse {
                error: Some("out of memory".to_string()),
                ..view(3, 10)
            },
            10,
        )
        .unwrap();
        assert_eq!(update.status, JobStatus::Failed);
        assert_eq!(update.error.as_deref(), Some("out of memory"));
        assert_eq!(update.progress, JobProgress::Units { got: 3, total: 10 });
    }

    #[test]
    fn test_error_only_poll_bodies_fail_the_job() {
        let training: TrainViewResponse =
            serde_json::from_str(r#"{"error": "model build crashed"}"#).unwrap();
        let update = training_update(training, 137).unwrap();
        assert_eq!(update.status, JobStatus::Failed);
        assert_eq!(update.progress, JobProgress::Unknown);
        assert_eq!(update.error.as_deref(), Some("model build crashed"));

        let parse: ProgressResponse =
            serde_json::from_str(r#"{"error": "parse crashed", "keyHref": "not a key"}"#).unwrap();
        let update = parse_update(parse).unwrap();
        assert_eq!(update.status, JobStatus::Failed);
        assert_eq!(update.error.as_deref(), Some("parse crashed"));
    }

    #[test]
    fn test_poll_body_without_status_or_error_is_a_protocol_error() {
        let training: TrainViewResponse = serde_json::from_str("{}").unwrap();
        assert!(matches!(
            training_update(training, 10),
            Err(HarnessError::Protocol { .. })
        ));

        let parse: ProgressResponse = serde_json::from_str(r#"{"progress": 0.5}"#).unwrap();
        assert!(matches!(parse_update(parse), Err(HarnessError::Protocol { .. })));
    }

    #[test]
    fn test_parse_progress_states() {
        let done = parse_update(ProgressResponse {
            key_href: Some("p_5.hex".to_string()),
            ..progress("done", None)
        })
        .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.unwrap().as_str(), "p_5.hex");

        let running = parse_update(progress("poll", Some(0.4))).unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.progress, JobProgress::Fraction(0.4));

        let unknown = parse_update(progress("sleeping", None));
        assert!(matches!(unknown, Err(HarnessError::Protocol { .. })));
    }
}
