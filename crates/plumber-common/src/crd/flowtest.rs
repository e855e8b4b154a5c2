//! FlowTest CRD types
//!
//! A FlowTest replays `sentMessages` as if they were emitted by
//! `referencePod` and reports which match rules and filter stages of
//! `referenceFlow` let them through.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::labels::Owner;

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of a FlowTest
///
/// An absent phase means the FlowTest has not been seen by the controller.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum FlowTestPhase {
    /// Finalizer attached, waiting for provisioning
    Created,
    /// Slices deployed, verification in progress
    Running,
    /// Verification finished (all passed or timed out)
    Completed,
    /// Provisioning failed
    Error,
}

impl std::fmt::Display for FlowTestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Error => write!(f, "Error"),
        }
    }
}

// =============================================================================
// Spec
// =============================================================================

/// Reference to an existing object by kind and namespaced name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ReferenceObject {
    /// Object kind (`Pod`, `Flow` or `ClusterFlow`)
    #[serde(default)]
    pub kind: String,
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
}

/// Pipeline test request
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "loggingpipelineplumber.isala.me",
    version = "v1beta1",
    kind = "FlowTest",
    plural = "flowtests",
    shortname = "ft",
    namespaced,
    status = "FlowTestStatus",
    printcolumn = r#"{"name":"ReferencePod","type":"string","jsonPath":".spec.referencePod.name"}"#,
    printcolumn = r#"{"name":"ReferenceFlow","type":"string","jsonPath":".spec.referenceFlow.name"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FlowTestSpec {
    /// Pod whose container, labels and node placement the simulation copies
    pub reference_pod: ReferenceObject,

    /// Flow or ClusterFlow under test
    pub reference_flow: ReferenceObject,

    /// Log lines replayed by the simulation pod
    #[serde(default)]
    pub sent_messages: Vec<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of a FlowTest
///
/// `match_status[i]` / `filter_status[i]` track the i-th match rule / filter
/// stage of the reference pipeline as it was when the test was provisioned.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowTestStatus {
    /// Current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FlowTestPhase>,

    /// Pass flag per reference match rule
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_status: Vec<bool>,

    /// Pass flag per reference filter stage
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_status: Vec<bool>,
}

impl FlowTestStatus {
    /// Status with only the phase set
    ///
    /// Serializes without the arrays, so a merge patch leaves them untouched.
    pub fn phase(phase: FlowTestPhase) -> Self {
        Self {
            status: Some(phase),
            ..Default::default()
        }
    }

    /// Fresh, all-false tracking arrays sized to the reference pipeline
    pub fn allocated(phase: FlowTestPhase, matches: usize, filters: usize) -> Self {
        Self {
            status: Some(phase),
            match_status: vec![false; matches],
            filter_status: vec![false; filters],
        }
    }

    /// True when every tracked entry has passed
    ///
    /// Vacuously true for a pipeline with no match rules and no filters.
    pub fn all_passed(&self) -> bool {
        self.match_status.iter().chain(&self.filter_status).all(|p| *p)
    }
}

impl FlowTest {
    /// Current phase, `None` if the controller has not touched this object
    pub fn phase(&self) -> Option<FlowTestPhase> {
        self.status.as_ref().and_then(|s| s.status)
    }

    /// Ownership identity used for labels, `None` until the API server assigns a UID
    pub fn owner(&self) -> Option<Owner<'_>> {
        Some(Owner {
            name: self.metadata.name.as_deref()?,
            uid: self.metadata.uid.as_deref()?,
        })
    }

    /// Whether deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the given finalizer is present
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }
}
