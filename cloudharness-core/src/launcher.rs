//! Sources of cluster nodes: attach to running servers or launch local ones

use crate::config::{ClusterConfig, SpawnConfig};
use crate::error::{HarnessError, HarnessResult, NodeObservation};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Endpoints for a cluster, plus any processes the harness owns
#[derive(Debug, Default)]
pub struct LaunchedNodes {
    pub endpoints: Vec<String>,
    pub processes: Vec<NodeProcess>,
}

/// A locally launched server process
#[derive(Debug)]
pub struct NodeProcess {
    pub index: usize,
    pub port: u16,
    pub pid: Option<u32>,
    child: Child,
}

impl NodeProcess {
    /// Wait up to `grace` for the process to exit on its own, then kill it
    pub async fn stop(&mut self, grace: Duration) -> Result<(), String> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(index = self.index, port = self.port, %status, "Node process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(format!("wait failed: {}", e)),
            Err(_) => {
                warn!(index = self.index, port = self.port, "Node process still running, killing");
                self.child
                    .kill()
                    .await
                    .map_err(|e| format!("kill failed: {}", e))
            }
        }
    }
}

impl NodeProcess {
    /// True once the process has exited and been reaped
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

/// Produces `count` node endpoints for a new cluster
#[async_trait]
pub trait NodeLauncher: Send + Sync {
    async fn launch(&self, count: usize) -> HarnessResult<LaunchedNodes>;
}

/// Pick the launcher a cluster config asks for. Configured endpoints win.
pub fn launcher_for(config: &ClusterConfig) -> HarnessResult<Box<dyn NodeLauncher>> {
    if !config.endpoints.is_empty() {
        return Ok(Box::new(AttachLauncher::new(config.endpoints.clone())));
    }
    match &config.spawn {
        Some(spawn) => Ok(Box::new(ProcessLauncher::new(spawn.clone()))),
        None => Err(HarnessError::Configuration {
            message: "no endpoints and no spawn section configured".to_string(),
        }),
    }
}

/// Attaches to servers that are already running
pub struct AttachLauncher {
    endpoints: Vec<String>,
}

impl AttachLauncher {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl NodeLauncher for AttachLauncher {
    async fn launch(&self, count: usize) -> HarnessResult<LaunchedNodes> {
        if self.endpoints.len() < count {
            return Err(HarnessError::ClusterFormation {
                expected: count,
                reason: format!("only {} endpoint(s) configured", self.endpoints.len()),
                observed: Vec::new(),
            });
        }
        Ok(LaunchedNodes {
            endpoints: self.endpoints[..count].to_vec(),
            processes: Vec::new(),
        })
    }
}

/// Launches one local server process per node
pub struct ProcessLauncher {
    spawn: SpawnConfig,
}

impl ProcessLauncher {
    pub fn new(spawn: SpawnConfig) -> Self {
        Self { spawn }
    }

    fn port_for(&self, index: usize) -> HarnessResult<u16> {
        let offset = index as u32 * self.spawn.port_stride as u32;
        u16::try_from(self.spawn.base_port as u32 + offset).map_err(|_| {
            HarnessError::Configuration {
                message: format!("port for node {} exceeds 65535", index),
            }
        })
    }

    fn args_for(&self, index: usize, port: u16) -> Vec<String> {
        self.spawn
            .args
            .iter()
            .map(|arg| {
                arg.replace("{port}", &port.to_string())
                    .replace("{index}", &index.to_string())
                    .replace("{cloud}", &self.spawn.cloud_name)
            })
            .collect()
    }

    fn output_for(&self, index: usize, stream: &str) -> HarnessResult<Stdio> {
        match &self.spawn.log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let file = std::fs::File::create(dir.join(format!("node-{}.{}.log", index, stream)))?;
                Ok(Stdio::from(file))
            }
            None => Ok(Stdio::null()),
        }
    }
}

#[async_trait]
impl NodeLauncher for ProcessLauncher {
    async fn launch(&self, count: usize) -> HarnessResult<LaunchedNodes> {
        let mut launched = LaunchedNodes::default();

        for index in 0..count {
            let port = self.port_for(index)?;
            let args = self.args_for(index, port);

            let mut cmd = Command::new(&self.spawn.program);
            cmd.args(&args)
                .stdin(Stdio::null())
                .stdout(self.output_for(index, "stdout")?)
                .stderr(self.output_for(index, "stderr")?)
                .kill_on_drop(true);

            // Already-launched children are killed on drop when this fails
            let child = cmd.spawn().map_err(|e| HarnessError::ClusterFormation {
                expected: count,
                reason: format!("failed to launch node {}: {}", index, e),
                observed: launched
                    .endpoints
                    .iter()
                    .map(|address| NodeObservation {
                        address: address.clone(),
                        reported_size: None,
                        error: Some("launched, not yet observed".to_string()),
                    })
                    .collect(),
            })?;
            let pid = child.id();
            info!(index, port, pid, program = %self.spawn.program, "Launched node process");

            launched
                .endpoints
                .push(format!("{}:{}", self.spawn.host, port));
            launched.processes.push(NodeProcess {
                index,
                port,
                pid,
                child,
            });
        }

        Ok(launched)
    }
}
