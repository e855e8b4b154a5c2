//! Controller configuration

use std::str::FromStr;
use std::time::Duration;

use plumber_common::AGGREGATOR_NAME;

/// Default namespace of the shared log aggregator
pub const DEFAULT_AGGREGATOR_NAMESPACE: &str = "default";
/// Time allowed for slices to become active before the first verification
pub const DEFAULT_WARMUP: Duration = Duration::from_secs(60);
/// Deadline after which a Running test is completed regardless of results
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
/// Delay between verification passes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Repository of the image replaying sent messages
pub const DEFAULT_SIMULATOR_IMAGE: &str = "ghcr.io/mrsupiri/logging-pipeline-plumber/pod-simulator";
/// Repository of the log aggregator image
pub const DEFAULT_AGGREGATOR_IMAGE: &str = "paynejacob/log-output";
/// Tag used for both images unless overridden
pub const DEFAULT_IMAGE_TAG: &str = "latest";
/// Pull policy used for both images unless overridden
pub const DEFAULT_PULL_POLICY: &str = "IfNotPresent";

/// Container image coordinates
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    /// Image repository
    pub repository: String,
    /// Image tag
    pub tag: String,
    /// Kubernetes pull policy (`Always`, `IfNotPresent`, `Never`)
    pub pull_policy: String,
}

impl Image {
    /// Build an image reference with the default pull policy
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
            pull_policy: DEFAULT_PULL_POLICY.to_string(),
        }
    }

    /// `repository:tag`
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

/// What to do with a slice once it has delivered logs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SlicePassPolicy {
    /// Delete the slice flow so it stops consuming pipeline capacity
    #[default]
    Delete,
    /// Keep the slice but mark its status inactive
    Deactivate,
}

impl FromStr for SlicePassPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "delete" => Ok(Self::Delete),
            "deactivate" => Ok(Self::Deactivate),
            other => Err(format!(
                "unknown slice pass policy '{other}', expected 'delete' or 'deactivate'"
            )),
        }
    }
}

impl std::fmt::Display for SlicePassPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delete => write!(f, "delete"),
            Self::Deactivate => write!(f, "deactivate"),
        }
    }
}

/// Runtime configuration of the FlowTest controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace the shared aggregator runs in
    pub aggregator_namespace: String,
    /// Override for the aggregator index listing URL
    pub log_output_endpoint: Option<String>,
    /// Image replaying the sent messages
    pub simulator_image: Image,
    /// Image of the shared log aggregator
    pub aggregator_image: Image,
    /// Delay between provisioning and the first verification
    pub warmup: Duration,
    /// Maximum time a test stays Running
    pub timeout: Duration,
    /// Delay between verification passes
    pub poll_interval: Duration,
    /// Handling of passing slices
    pub pass_policy: SlicePassPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            aggregator_namespace: DEFAULT_AGGREGATOR_NAMESPACE.to_string(),
            log_output_endpoint: None,
            simulator_image: Image::new(DEFAULT_SIMULATOR_IMAGE, DEFAULT_IMAGE_TAG),
            aggregator_image: Image::new(DEFAULT_AGGREGATOR_IMAGE, DEFAULT_IMAGE_TAG),
            warmup: DEFAULT_WARMUP,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            pass_policy: SlicePassPolicy::Delete,
        }
    }
}

impl ControllerConfig {
    /// In-cluster base URL of the aggregator service, without trailing slash
    pub fn aggregator_base_url(&self) -> String {
        format!(
            "http://{AGGREGATOR_NAME}.{}.svc",
            self.aggregator_namespace
        )
    }

    /// URL listing the aggregator's indexes
    pub fn index_endpoint(&self) -> String {
        self.log_output_endpoint
            .clone()
            .unwrap_or_else(|| format!("{}/", self.aggregator_base_url()))
    }
}
