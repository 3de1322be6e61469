use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use cloudharness_core::{
    observability::init_tracing, types::NodeRole, ClusterManager, HarnessConfig, NodeHandle,
};

#[derive(Parser)]
#[command(name = "cloudharness")]
#[command(about = "Bring up a compute cluster and verify it forms", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Build or attach to a cluster, wait for quorum, then tear it down
    Stabilize {
        /// Harness configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured node count
        #[arg(long)]
        nodes: Option<usize>,

        /// Leave the nodes running afterwards
        #[arg(long)]
        no_teardown: bool,
    },
    /// Show one node's view of cluster membership
    Status {
        /// Node endpoint (e.g., 127.0.0.1:54321)
        #[arg(long)]
        endpoint: String,

        /// Request timeout
        #[arg(long, default_value = "10s", value_parser = humantime_duration)]
        timeout: Duration,
    },
}

fn humantime_duration(raw: &str) -> Result<Duration, String> {
    raw.parse::<humantime_serde::re::humantime::Duration>()
        .map(Into::into)
        .map_err(|e| e.to_string())
}

fn load_config(path: Option<PathBuf>, nodes: Option<usize>) -> Result<HarnessConfig> {
    let mut config = match path {
        Some(path) => HarnessConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = HarnessConfig::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Some(nodes) = nodes {
        config.cluster.node_count = nodes;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Stabilize {
            config,
            nodes,
            no_teardown,
        } => {
            let config = load_config(config, nodes)?;
            init_tracing(Some(config.logging.level.as_str()));

            let count = config.cluster.node_count;
            let timeouts = config.timeouts.clone();
            let manager = ClusterManager::new(config)?;

            let mut cluster = manager.build_cloud(count).await?;
            let verdict = manager
                .stabilize(&mut cluster, timeouts.stabilize, timeouts.debounce)
                .await;

            let report = serde_json::json!({
                "expected_size": cluster.expected_size(),
                "state": cluster.state().to_string(),
                "nodes": cluster
                    .last_observed()
                    .iter()
                    .map(|o| serde_json::json!({
                        "address": o.address,
                        "cloud_size": o.reported_size,
                        "error": o.error,
                    }))
                    .collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);

            if no_teardown {
                tracing::info!("Leaving {} node(s) running", cluster.len());
            } else {
                let teardown = manager.tear_down(&mut cluster).await;
                if let Some(partial) = teardown.partial_failure {
                    tracing::warn!("{}", partial);
                }
            }

            verdict.context("cluster did not stabilize")?;
        }
        Commands::Status { endpoint, timeout } => {
            init_tracing(None);
            let node = NodeHandle::new(&endpoint, NodeRole::Member, timeout)?;
            let status = node
                .cloud_status()
                .await
                .with_context(|| format!("querying {}", endpoint))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
