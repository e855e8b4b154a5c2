//! Ownership labels
//!
//! Every object the controller creates is identified by labels only (no owner
//! references), so label construction lives in exactly one place. Cleanup and
//! verification select on the same keys this module writes.

use std::collections::BTreeMap;

/// Label domain used for plumber-specific keys
pub const DOMAIN: &str = "loggingpipelineplumber.isala.me";

/// `app.kubernetes.io/name`
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
/// `app.kubernetes.io/created-by`
pub const CREATED_BY_LABEL: &str = "app.kubernetes.io/created-by";
/// `app.kubernetes.io/managed-by`
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Name of the owning FlowTest
pub const FLOWTEST_LABEL: &str = "loggingpipelineplumber.isala.me/flowtest";
/// UID of the owning FlowTest
pub const FLOWTEST_UID_LABEL: &str = "loggingpipelineplumber.isala.me/flowtest-uuid";
/// Slice sequence number within a FlowTest
pub const TEST_ID_LABEL: &str = "loggingpipelineplumber.isala.me/test-id";
/// Slice kind, see [`TestType`]
pub const TEST_TYPE_LABEL: &str = "loggingpipelineplumber.isala.me/test-type";
/// Component of shared infrastructure
pub const COMPONENT_LABEL: &str = "loggingpipelineplumber.isala.me/component";

/// Value of [`CREATED_BY_LABEL`]
pub const CREATED_BY: &str = "logging-plumber";
/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY: &str = "logging-pipeline-plumber";
/// Value of [`COMPONENT_LABEL`] on the shared aggregator
pub const AGGREGATOR_COMPONENT: &str = "log-aggregator";

/// Identity of the FlowTest that owns an object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Owner<'a> {
    /// FlowTest name
    pub name: &'a str,
    /// FlowTest UID
    pub uid: &'a str,
}

/// Which part of a reference pipeline a slice exercises
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TestType {
    /// Slice isolating a single match rule
    Match,
    /// Slice applying a prefix of the filter chain
    Filter,
}

impl TestType {
    /// Label value for this test type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::Filter => "filter",
        }
    }

    /// Parse a label value
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "match" => Some(Self::Match),
            "filter" => Some(Self::Filter),
            _ => None,
        }
    }
}

impl std::fmt::Display for TestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the ownership labels for an object
///
/// `extra` maps are merged in order, then the fixed keys are written on top:
/// a caller-supplied map can never override ownership.
pub fn ownership_labels(
    name: &str,
    owner: Option<Owner<'_>>,
    extra: &[&BTreeMap<String, String>],
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for map in extra {
        labels.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    labels.insert(NAME_LABEL.to_string(), name.to_string());
    labels.insert(CREATED_BY_LABEL.to_string(), CREATED_BY.to_string());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    if let Some(owner) = owner {
        labels.insert(FLOWTEST_LABEL.to_string(), owner.name.to_string());
        labels.insert(FLOWTEST_UID_LABEL.to_string(), owner.uid.to_string());
    }
    labels
}

/// Labels for a single slice: ownership plus test id and type
pub fn slice_labels(
    reference_name: &str,
    owner: Owner<'_>,
    test_id: usize,
    test_type: TestType,
) -> BTreeMap<String, String> {
    let slice = BTreeMap::from([
        (TEST_ID_LABEL.to_string(), test_id.to_string()),
        (TEST_TYPE_LABEL.to_string(), test_type.as_str().to_string()),
    ]);
    ownership_labels(reference_name, Some(owner), &[&slice])
}

/// Labels of the shared log aggregator Pod and Service
pub fn aggregator_labels(name: &str) -> BTreeMap<String, String> {
    let component = BTreeMap::from([(
        COMPONENT_LABEL.to_string(),
        AGGREGATOR_COMPONENT.to_string(),
    )]);
    ownership_labels(name, None, &[&component])
}

/// Selector matching every object owned by the named FlowTest
pub fn flow_test_selector(flow_test: &str) -> String {
    format!("{FLOWTEST_LABEL}={flow_test}")
}

/// Selector matching the shared aggregator objects
pub fn aggregator_selector() -> String {
    format!("{COMPONENT_LABEL}={AGGREGATOR_COMPONENT}")
}
