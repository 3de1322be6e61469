// Common helpers for integration tests against fake nodes

#![allow(dead_code)]

use cloudharness_core::{
    test_helpers::{attach_config, fast_timeouts, FakeCluster, FakeNode},
    types::NodeRole,
    ClusterManager, HarnessConfig, NodeHandle,
};
use std::time::Duration;

pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Route harness logs to the test output when RUST_LOG is set
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        cloudharness_core::observability::init_tracing(None);
    }
}

pub fn config_for(fakes: &FakeCluster) -> HarnessConfig {
    attach_config(fakes.endpoints())
}

pub fn manager_for(fakes: &FakeCluster) -> ClusterManager {
    ClusterManager::new(config_for(fakes)).expect("attach config is valid")
}

pub fn handle_for(fake: &FakeNode) -> NodeHandle {
    NodeHandle::new(&fake.endpoint(), NodeRole::Coordinator, REQUEST_TIMEOUT)
        .expect("fake endpoint is a valid address")
}

pub fn timeouts() -> cloudharness_core::config::TimeoutConfig {
    fast_timeouts()
}
