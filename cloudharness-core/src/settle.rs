//! Waiting for written data to become visible cluster-wide

use crate::error::HarnessResult;
use crate::node::NodeHandle;
use crate::poller::{self, Observation, PollSpec, Probe};
use crate::types::Key;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::info;

/// Poll `store_view` on every node until `key` is listed by all of them.
///
/// A key returned by a put is resident on the receiving node only; call this
/// before reading it through any other node.
pub async fn settle_key(nodes: &[Arc<NodeHandle>], key: &Key, spec: &PollSpec) -> HarnessResult<()> {
    let mut probe = VisibilityProbe {
        nodes,
        key,
        missing: nodes.iter().map(|n| n.address().to_string()).collect(),
    };
    poller::wait_until(&mut probe, spec).await?;
    info!(key = %key, nodes = nodes.len(), "Key settled");
    Ok(())
}

struct VisibilityProbe<'a> {
    nodes: &'a [Arc<NodeHandle>],
    key: &'a Key,
    missing: Vec<String>,
}

#[async_trait]
impl<'a> Probe for VisibilityProbe<'a> {
    type Output = ();

    async fn observe(&mut self) -> HarnessResult<Observation<()>> {
        let key = self.key.as_str();
        let views = join_all(self.nodes.iter().map(|node| async move {
            let keys = node.store_view().await?;
            Ok::<_, crate::error::HarnessError>((node.address(), keys.iter().any(|k| k == key)))
        }))
        .await;

        let mut missing = Vec::new();
        for view in views {
            let (address, visible) = view?;
            if !visible {
                missing.push(address.to_string());
            }
        }
        self.missing = missing;

        if self.missing.is_empty() {
            Ok(Observation::Ready(()))
        } else {
            Ok(Observation::Pending)
        }
    }

    fn diagnostic(&self) -> String {
        format!("{} not yet visible on [{}]", self.key, self.missing.join(", "))
    }
}
