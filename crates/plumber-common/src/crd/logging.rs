//! logging-operator resources (`logging.banzaicloud.io/v1beta1`)
//!
//! Only the fields the plumber reads or writes are typed. Match rules and
//! filter stages are kept as opaque JSON [`Rule`]s: the plumber never
//! interprets the routing DSL, it only copies entries and compares them.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// =============================================================================
// Rule
// =============================================================================

/// One match rule or filter stage
///
/// Equality is structural over the JSON value, so key order in the source
/// manifest does not matter.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(transparent)]
pub struct Rule(Value);

impl Rule {
    /// Wrap a raw JSON value
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Grep filter keeping only records whose `key` matches `pattern`
    pub fn grep_regexp(key: &str, pattern: &str) -> Self {
        Self(json!({
            "grep": {
                "regexp": [{"key": key, "pattern": pattern}]
            }
        }))
    }

    /// Match rule selecting pods by labels
    pub fn select_labels(labels: &BTreeMap<String, String>) -> Self {
        Self(json!({
            "select": {"labels": labels}
        }))
    }
}

// =============================================================================
// Flow / ClusterFlow
// =============================================================================

/// Status reported by the logging-operator on flows
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowStatus {
    /// Whether the flow is active in the rendered configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

/// Namespaced log flow
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "logging.banzaicloud.io",
    version = "v1beta1",
    kind = "Flow",
    plural = "flows",
    namespaced,
    status = "FlowStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct FlowSpec {
    /// Ordered match rules
    #[serde(default, rename = "match", skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<Rule>,

    /// Ordered filter stages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Rule>,

    /// Outputs in the flow's namespace
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_output_refs: Vec<String>,

    /// ClusterOutputs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub global_output_refs: Vec<String>,
}

/// Cluster-wide log flow, stored in the logging control namespace
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "logging.banzaicloud.io",
    version = "v1beta1",
    kind = "ClusterFlow",
    plural = "clusterflows",
    namespaced,
    status = "FlowStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterFlowSpec {
    /// Ordered match rules
    #[serde(default, rename = "match", skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<Rule>,

    /// Ordered filter stages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Rule>,

    /// ClusterOutputs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub global_output_refs: Vec<String>,
}

// =============================================================================
// Output / ClusterOutput
// =============================================================================

/// Output buffer section
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Buffer {
    /// Flush strategy (`interval`, `immediate`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flush_mode: Option<String>,

    /// Flush period when `flush_mode` is `interval`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flush_interval: Option<String>,
}

/// HTTP output plugin
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct HttpOutput {
    /// Target URL
    pub endpoint: String,

    /// Buffering behaviour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<Buffer>,
}

/// Namespaced log output
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "logging.banzaicloud.io",
    version = "v1beta1",
    kind = "Output",
    plural = "outputs",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct OutputSpec {
    /// HTTP plugin configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpOutput>,
}

/// Cluster-wide log output, stored in the logging control namespace
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "logging.banzaicloud.io",
    version = "v1beta1",
    kind = "ClusterOutput",
    plural = "clusteroutputs",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOutputSpec {
    /// Same plugin sections as a namespaced Output
    #[serde(flatten)]
    pub output: OutputSpec,

    /// Namespaces allowed to reference this output
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled_namespaces: Vec<String>,
}
