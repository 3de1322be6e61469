//! Helpers for tests that drive the harness against fake nodes
//!
//! - `fake_node`: an in-process HTTP server speaking the node JSON contract
//! - timing helpers that scale with the CI timeout multiplier

pub mod fake_node;

pub use fake_node::{FakeCluster, FakeNode};

use crate::config::{timeout_multiplier, ClusterConfig, HarnessConfig, TimeoutConfig};
use std::time::Duration;

/// Apply the CI timeout multiplier to a duration
pub fn scaled_timeout(base: Duration) -> Duration {
    base.saturating_mul(timeout_multiplier())
}

/// Short timeouts suited to in-process fake nodes
pub fn fast_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        startup: scaled_timeout(Duration::from_secs(2)),
        stabilize: scaled_timeout(Duration::from_secs(5)),
        debounce: Duration::from_millis(300),
        poll_interval: Duration::from_millis(50),
        max_poll_interval: Duration::from_millis(200),
        job: scaled_timeout(Duration::from_secs(5)),
        drain: scaled_timeout(Duration::from_secs(5)),
        settle: scaled_timeout(Duration::from_secs(3)),
        request: Duration::from_millis(500),
        shutdown_grace: Duration::from_millis(500),
    }
}

/// Configuration attaching to `endpoints` with [`fast_timeouts`]
pub fn attach_config(endpoints: Vec<String>) -> HarnessConfig {
    HarnessConfig {
        cluster: ClusterConfig {
            node_count: endpoints.len(),
            endpoints,
            spawn: None,
        },
        timeouts: fast_timeouts(),
        ..HarnessConfig::default()
    }
}

/// An endpoint nothing is listening on
pub async fn unused_endpoint() -> std::io::Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr.to_string())
}
