//! Classifier Agent
//!
//! In-cluster agent that evaluates Classifier rules against the cluster it
//! runs in, publishes a ClassifierReport per rule, and optionally forwards
//! the reports to the management cluster.

mod agent;
mod backoff;
mod client;
mod error;
mod evaluator;
mod forwarder;
mod queue;
mod registry;
mod report;
mod scheduler;

use std::time::Duration;

use agent::{Agent, AgentConfig};
use clap::Parser;
use error::AgentError;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crds::ClusterType;

#[derive(Debug, Parser)]
#[clap(name = "classifier-agent", about = "Evaluates Classifier rules against the cluster it runs in")]
struct Args {
    /// Seconds between evaluation ticks
    #[clap(long, default_value = "10", env = "CLASSIFIER_AGENT_INTERVAL_SECONDS")]
    interval_seconds: u32,

    /// Forward reports to the management cluster
    #[clap(long, env = "CLASSIFIER_AGENT_SEND_REPORT")]
    send_report: bool,

    /// Namespace this cluster is registered under in the management cluster
    #[clap(long, default_value = "", env = "CLASSIFIER_AGENT_CLUSTER_NAMESPACE")]
    cluster_namespace: String,

    /// Name this cluster is registered under in the management cluster
    #[clap(long, default_value = "", env = "CLASSIFIER_AGENT_CLUSTER_NAME")]
    cluster_name: String,

    /// Kind of cluster this agent runs in: Capi or Sveltos
    #[clap(long, default_value = "Capi", env = "CLASSIFIER_AGENT_CLUSTER_TYPE")]
    cluster_type: ClusterType,
}

#[tokio::main]
async fn main() -> Result<(), AgentError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.interval_seconds == 0 {
        return Err(AgentError::InvalidConfig(
            "interval-seconds must be positive".to_string(),
        ));
    }

    info!(
        interval_seconds = args.interval_seconds,
        send_report = args.send_report,
        cluster = %args.cluster_name,
        "starting classifier agent"
    );

    let client = kube::Client::try_default().await?;
    let agent = Agent::new(
        client,
        AgentConfig {
            interval: Duration::from_secs(u64::from(args.interval_seconds)),
            send_report: args.send_report,
            cluster_namespace: args.cluster_namespace,
            cluster_name: args.cluster_name,
            cluster_type: args.cluster_type,
        },
    );
    agent.run().await
}
