//! Logging Pipeline Plumber - FlowTest operator for logging-operator pipelines

use std::time::Duration;

use clap::Parser;
use futures::future::join_all;
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use plumber_common::crd::FlowTest;
use plumber_flowtest::config::{
    DEFAULT_AGGREGATOR_NAMESPACE, DEFAULT_AGGREGATOR_IMAGE, DEFAULT_IMAGE_TAG,
    DEFAULT_PULL_POLICY, DEFAULT_SIMULATOR_IMAGE,
};
use plumber_flowtest::{ControllerConfig, Image, SlicePassPolicy};

mod controller_runner;

/// Logging Pipeline Plumber - verifies logging pipelines with synthetic traffic
#[derive(Parser, Debug)]
#[command(name = "plumber-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the FlowTest CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Namespace of the shared log aggregator
    #[arg(long, env = "AGGREGATOR_NAMESPACE", default_value = DEFAULT_AGGREGATOR_NAMESPACE)]
    aggregator_namespace: String,

    /// Index listing URL, overriding the in-cluster aggregator service
    #[arg(long, env = "LOG_OUTPUT_ENDPOINT")]
    log_output_endpoint: Option<String>,

    /// Pod simulator image repository
    #[arg(long, env = "SIMULATOR_IMAGE", default_value = DEFAULT_SIMULATOR_IMAGE)]
    simulator_image: String,

    /// Pod simulator image tag
    #[arg(long, env = "SIMULATOR_TAG", default_value = DEFAULT_IMAGE_TAG)]
    simulator_tag: String,

    /// Pod simulator pull policy
    #[arg(long, env = "SIMULATOR_PULL_POLICY", default_value = DEFAULT_PULL_POLICY)]
    simulator_pull_policy: String,

    /// Log aggregator image repository
    #[arg(long, env = "AGGREGATOR_IMAGE", default_value = DEFAULT_AGGREGATOR_IMAGE)]
    aggregator_image: String,

    /// Log aggregator image tag
    #[arg(long, env = "AGGREGATOR_TAG", default_value = DEFAULT_IMAGE_TAG)]
    aggregator_tag: String,

    /// Log aggregator pull policy
    #[arg(long, env = "AGGREGATOR_PULL_POLICY", default_value = DEFAULT_PULL_POLICY)]
    aggregator_pull_policy: String,

    /// Seconds to wait after provisioning before the first verification
    #[arg(long, env = "WARMUP_SECS", default_value_t = 60)]
    warmup_secs: u64,

    /// Seconds after creation at which a FlowTest is completed regardless
    #[arg(long, env = "TIMEOUT_SECS", default_value_t = 300)]
    timeout_secs: u64,

    /// Seconds between verification passes
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 30)]
    poll_interval_secs: u64,

    /// What to do with a slice once it passed (delete or deactivate)
    #[arg(long, env = "SLICE_PASS_POLICY", default_value_t = SlicePassPolicy::Delete)]
    slice_pass_policy: SlicePassPolicy,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            aggregator_namespace: self.aggregator_namespace.clone(),
            log_output_endpoint: self.log_output_endpoint.clone(),
            simulator_image: Image {
                repository: self.simulator_image.clone(),
                tag: self.simulator_tag.clone(),
                pull_policy: self.simulator_pull_policy.clone(),
            },
            aggregator_image: Image {
                repository: self.aggregator_image.clone(),
                tag: self.aggregator_tag.clone(),
                pull_policy: self.aggregator_pull_policy.clone(),
            },
            warmup: Duration::from_secs(self.warmup_secs),
            timeout: Duration::from_secs(self.timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            pass_policy: self.slice_pass_policy,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&FlowTest::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller(cli.controller_config()).await
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    tracing::info!(
        aggregator_namespace = %config.aggregator_namespace,
        index_endpoint = %config.index_endpoint(),
        pass_policy = %config.pass_policy,
        "Starting FlowTest controller"
    );

    let controllers = controller_runner::build_flowtest_controllers(client, config)?;
    join_all(controllers).await;

    tracing::info!("Controller shut down");
    Ok(())
}
