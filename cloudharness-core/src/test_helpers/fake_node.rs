//! In-process fake cluster node
//!
//! Serves the node JSON contract over HTTP on an ephemeral port. Reported
//! cloud size, parse latency and training progress are scripted against the
//! time since the node started, so tests can stage membership flaps and slow
//! jobs without a real cluster.

use crate::node::paths;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Params = Query<HashMap<String, String>>;

struct ParseJob {
    source: String,
    destination: String,
    submitted: Duration,
}

struct Model {
    total: u64,
    submitted: Duration,
}

struct Script {
    /// (offset from start, size), in insertion order
    sizes: Vec<(Duration, usize)>,
    store: BTreeMap<String, Bytes>,
    /// Keys that appear in the store view only after an offset
    arriving: Vec<(Duration, String)>,
    parse_latency: Option<Duration>,
    parse_error: Option<String>,
    parses: BTreeMap<String, ParseJob>,
    trees_per_sec: f64,
    tree_cap: Option<u64>,
    training_error: Option<String>,
    /// Every job poll answers with only this error
    poll_crash: Option<String>,
    models: BTreeMap<String, Model>,
    fail_shutdown: bool,
    shutdown_requests: usize,
    requests: BTreeMap<&'static str, usize>,
}

struct FakeState {
    address: String,
    started: Instant,
    /// Set once stopped: requests hang until the client gives up
    dark: AtomicBool,
    script: Mutex<Script>,
}

impl FakeState {
    fn now(&self) -> Duration {
        self.started.elapsed()
    }

    async fn hit(&self, path: &'static str) {
        if self.dark.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        *self.script.lock().requests.entry(path).or_default() += 1;
    }

    fn cloud_size(&self, script: &Script) -> usize {
        let now = self.now();
        script
            .sizes
            .iter()
            .filter(|(at, _)| *at <= now)
            .last()
            .map(|(_, size)| *size)
            .unwrap_or(1)
    }
}

fn rejected(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn fresh_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

/// A fake node serving on `127.0.0.1`
pub struct FakeNode {
    addr: SocketAddr,
    state: Arc<FakeState>,
    stop_tx: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl FakeNode {
    /// Bind an ephemeral port and start serving. Reports cloud size 1 until
    /// told otherwise.
    pub async fn start() -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(FakeState {
            address: addr.to_string(),
            started: Instant::now(),
            dark: AtomicBool::new(false),
            script: Mutex::new(Script {
                sizes: Vec::new(),
                store: BTreeMap::new(),
                arriving: Vec::new(),
                parse_latency: None,
                parse_error: None,
                parses: BTreeMap::new(),
                trees_per_sec: 1_000.0,
                tree_cap: None,
                training_error: None,
                poll_crash: None,
                models: BTreeMap::new(),
                fail_shutdown: false,
                shutdown_requests: 0,
                requests: BTreeMap::new(),
            }),
        });

        let router = Router::new()
            .route(&route(paths::CLOUD), get(cloud))
            .route(&route(paths::PUT_FILE), post(put_file))
            .route(&route(paths::PUT_VALUE), get(put_value))
            .route(&route(paths::PARSE), get(parse))
            .route(&route(paths::PROGRESS), get(progress))
            .route(&route(paths::TRAIN), get(train))
            .route(&route(paths::TRAIN_VIEW), get(train_view))
            .route(&route(paths::STORE_VIEW), get(store_view))
            .route(&route(paths::GET), get(get_value))
            .route(&route(paths::SHUTDOWN), get(shutdown))
            .with_state(state.clone());

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await;
        });

        Ok(Self {
            addr,
            state,
            stop_tx: Some(stop_tx),
            server: Some(server),
        })
    }

    /// `host:port` to hand to a `NodeHandle`
    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Report `size` from now on
    pub fn report_size(&self, size: usize) {
        let now = self.state.now();
        self.state.script.lock().sizes.push((now, size));
    }

    /// Report `size` once `delay` has passed
    pub fn report_size_after(&self, delay: Duration, size: usize) {
        let at = self.state.now() + delay;
        self.state.script.lock().sizes.push((at, size));
    }

    /// Parses run asynchronously and finish after `latency`
    pub fn parse_latency(&self, latency: Duration) {
        self.state.script.lock().parse_latency = Some(latency);
    }

    /// Refuse every parse submission with `message`
    pub fn reject_parses(&self, message: &str) {
        self.state.script.lock().parse_error = Some(message.to_string());
    }

    /// Trees built per second by every training job
    pub fn training_rate(&self, trees_per_sec: f64) {
        self.state.script.lock().trees_per_sec = trees_per_sec;
    }

    /// Training jobs stall once they have built `cap` trees
    pub fn training_cap(&self, cap: u64) {
        self.state.script.lock().tree_cap = Some(cap);
    }

    /// Training jobs report `message` as their error
    pub fn fail_training(&self, message: &str) {
        self.state.script.lock().training_error = Some(message.to_string());
    }

    pub fn insert_key(&self, key: &str, value: impl Into<Bytes>) {
        self.state
            .script
            .lock()
            .store
            .insert(key.to_string(), value.into());
    }

    /// `key` shows up in this node's store view after `delay`
    pub fn insert_key_after(&self, delay: Duration, key: &str) {
        let at = self.state.now() + delay;
        self.state.script.lock().arriving.push((at, key.to_string()));
    }

    /// Job polls answer HTTP 500 with an error-only body
    pub fn crash_job_polls(&self, message: &str) {
        self.state.script.lock().poll_crash = Some(message.to_string());
    }

    pub fn fail_shutdown(&self) {
        self.state.script.lock().fail_shutdown = true;
    }

    pub fn shutdown_requests(&self) -> usize {
        self.state.script.lock().shutdown_requests
    }

    /// Requests served for an endpoint path such as `paths::CLOUD`
    pub fn request_count(&self, path: &str) -> usize {
        self.state
            .script
            .lock()
            .requests
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.script.lock().store.keys().cloned().collect()
    }

    /// Stop serving. Later requests fail at the transport level, either
    /// refused or timed out on a pooled connection.
    pub async fn stop(&mut self) {
        self.state.dark.store(true, Ordering::SeqCst);
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            if tokio::time::timeout(Duration::from_secs(2), server).await.is_err() {
                tracing::warn!(node = %self.addr, "Fake node did not stop gracefully");
            }
        }
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

/// A set of fake nodes started together
pub struct FakeCluster {
    pub nodes: Vec<FakeNode>,
}

impl FakeCluster {
    /// Start `n` nodes that all report size `n` immediately
    pub async fn formed(n: usize) -> std::io::Result<Self> {
        let cluster = Self::start(n).await?;
        for node in &cluster.nodes {
            node.report_size(n);
        }
        Ok(cluster)
    }

    /// Start `n` nodes each reporting size 1
    pub async fn start(n: usize) -> std::io::Result<Self> {
        let mut nodes = Vec::with_capacity(n);
        for _ in 0..n {
            nodes.push(FakeNode::start().await?);
        }
        Ok(Self { nodes })
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.nodes.iter().map(FakeNode::endpoint).collect()
    }

    pub fn node(&self, index: usize) -> &FakeNode {
        &self.nodes[index]
    }
}

fn route(path: &str) -> String {
    format!("/{}", path)
}

async fn cloud(State(node): State<Arc<FakeState>>) -> Response {
    node.hit(paths::CLOUD).await;
    let script = node.script.lock();
    let size = node.cloud_size(&script);
    let members: Vec<Value> = (0..size)
        .map(|i| json!({ "name": format!("/{}#{}", node.address, i) }))
        .collect();
    Json(json!({ "cloud_size": size, "nodes": members })).into_response()
}

fn store_value(node: &FakeState, key: Option<&String>, value: Bytes) -> Response {
    let key = key.cloned().unwrap_or_else(|| fresh_id("key"));
    let size = value.len();
    node.script.lock().store.insert(key.clone(), value);
    Json(json!({ "keyHref": key, "size": size })).into_response()
}

async fn put_file(State(node): State<Arc<FakeState>>, Query(params): Params, body: Bytes) -> Response {
    node.hit(paths::PUT_FILE).await;
    store_value(&node, params.get("key"), body)
}

async fn put_value(State(node): State<Arc<FakeState>>, Query(params): Params) -> Response {
    node.hit(paths::PUT_VALUE).await;
    let Some(value) = params.get("value") else {
        return rejected(StatusCode::BAD_REQUEST, "missing value");
    };
    store_value(&node, params.get("key"), Bytes::from(value.clone()))
}

async fn parse(State(node): State<Arc<FakeState>>, Query(params): Params) -> Response {
    node.hit(paths::PARSE).await;
    let (Some(source), Some(destination)) = (params.get("source_key"), params.get("destination_key")) else {
        return rejected(StatusCode::BAD_REQUEST, "missing source_key or destination_key");
    };

    let submitted = node.now();
    let mut script = node.script.lock();
    if let Some(message) = &script.parse_error {
        return rejected(StatusCode::BAD_REQUEST, message.clone());
    }
    let Some(data) = script.store.get(source).cloned() else {
        return rejected(StatusCode::NOT_FOUND, format!("key {} not found", source));
    };

    match script.parse_latency {
        None => {
            script.store.insert(destination.clone(), data);
            Json(json!({ "keyHref": destination })).into_response()
        }
        Some(_) => {
            let job = fresh_id("job");
            script.parses.insert(
                job.clone(),
                ParseJob {
                    source: source.clone(),
                    destination: destination.clone(),
                    submitted,
                },
            );
            Json(json!({ "jobHref": job })).into_response()
        }
    }
}

async fn progress(State(node): State<Arc<FakeState>>, Query(params): Params) -> Response {
    node.hit(paths::PROGRESS).await;
    let now = node.now();
    let mut script = node.script.lock();
    if let Some(message) = &script.poll_crash {
        return rejected(StatusCode::INTERNAL_SERVER_ERROR, message.clone());
    }
    let latency = script.parse_latency.unwrap_or_default();

    let Some(job) = params.get("job").and_then(|job| script.parses.get(job)) else {
        return rejected(StatusCode::NOT_FOUND, "unknown job");
    };
    let elapsed = now.saturating_sub(job.submitted);
    if elapsed < latency {
        let fraction = elapsed.as_secs_f64() / latency.as_secs_f64();
        return Json(json!({ "status": "poll", "progress": fraction })).into_response();
    }

    let destination = job.destination.clone();
    let data = script.store.get(&job.source).cloned().unwrap_or_default();
    script.store.entry(destination.clone()).or_insert(data);
    Json(json!({ "status": "done", "progress": 1.0, "keyHref": destination })).into_response()
}

async fn train(State(node): State<Arc<FakeState>>, Query(params): Params) -> Response {
    node.hit(paths::TRAIN).await;
    let submitted = node.now();
    let mut script = node.script.lock();

    let Some(data) = params.get("data_key") else {
        return rejected(StatusCode::BAD_REQUEST, "missing data_key");
    };
    if !script.store.contains_key(data) {
        return rejected(StatusCode::NOT_FOUND, format!("key {} not found", data));
    }
    let Some(total) = params.get("ntree").and_then(|n| n.parse::<u64>().ok()) else {
        return rejected(StatusCode::BAD_REQUEST, "ntree must be an integer");
    };

    let model = params
        .get("model_key")
        .cloned()
        .unwrap_or_else(|| fresh_id("model"));
    script.models.insert(model.clone(), Model { total, submitted });
    Json(json!({ "confKeyHref": model })).into_response()
}

async fn train_view(State(node): State<Arc<FakeState>>, Query(params): Params) -> Response {
    node.hit(paths::TRAIN_VIEW).await;
    let now = node.now();
    let script = node.script.lock();
    if let Some(message) = &script.poll_crash {
        return rejected(StatusCode::INTERNAL_SERVER_ERROR, message.clone());
    }

    let Some(model) = params.get("model_key").and_then(|m| script.models.get(m)) else {
        return rejected(StatusCode::NOT_FOUND, "unknown model");
    };
    let built = (now.saturating_sub(model.submitted).as_secs_f64() * script.trees_per_sec) as u64;
    let got = built
        .min(model.total)
        .min(script.tree_cap.unwrap_or(u64::MAX));

    let body = match &script.training_error {
        Some(message) => json!({ "got": got, "total": model.total, "error": message }),
        None => json!({ "got": got, "total": model.total }),
    };
    Json(body).into_response()
}

async fn store_view(State(node): State<Arc<FakeState>>) -> Response {
    node.hit(paths::STORE_VIEW).await;
    let now = node.now();
    let script = node.script.lock();
    let mut keys: Vec<&String> = script.store.keys().collect();
    keys.extend(
        script
            .arriving
            .iter()
            .filter(|(at, _)| *at <= now)
            .map(|(_, key)| key),
    );
    let keys: Vec<Value> = keys.into_iter().map(|key| json!({ "key": key })).collect();
    Json(json!({ "keys": keys })).into_response()
}

async fn get_value(State(node): State<Arc<FakeState>>, Query(params): Params) -> Response {
    node.hit(paths::GET).await;
    let script = node.script.lock();
    match params.get("key").and_then(|key| script.store.get(key)) {
        Some(value) => value.clone().into_response(),
        None => rejected(StatusCode::NOT_FOUND, "key not found"),
    }
}

async fn shutdown(State(node): State<Arc<FakeState>>) -> Response {
    node.hit(paths::SHUTDOWN).await;
    let mut script = node.script.lock();
    script.shutdown_requests += 1;
    if script.fail_shutdown {
        return rejected(StatusCode::INTERNAL_SERVER_ERROR, "shutdown refused");
    }
    Json(json!({})).into_response()
}
