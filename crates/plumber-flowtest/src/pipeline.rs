//! Kind-agnostic views over Flow/ClusterFlow and Output/ClusterOutput
//!
//! A FlowTest may reference either flow kind; slices are always created with
//! the same kind as their reference, so everything downstream works on these
//! enums instead of branching on the kind string.

use std::collections::BTreeMap;

use kube::ResourceExt;

use plumber_common::crd::{ClusterFlow, ClusterOutput, Flow, FlowTest, Output, Rule};
use plumber_common::labels::{TestType, TEST_TYPE_LABEL};
use plumber_common::{Error, Result};

/// Which flow kind a FlowTest references
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineKind {
    /// Namespaced `Flow`, routed to `Output`s
    Flow,
    /// `ClusterFlow`, routed to `ClusterOutput`s
    ClusterFlow,
}

impl PipelineKind {
    /// Parse a manifest kind
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "Flow" => Some(Self::Flow),
            "ClusterFlow" => Some(Self::ClusterFlow),
            _ => None,
        }
    }

    /// Kind of the flow a FlowTest references
    pub fn of(flow_test: &FlowTest) -> Result<Self> {
        let kind = &flow_test.spec.reference_flow.kind;
        Self::parse(kind).ok_or_else(|| {
            Error::validation_for(
                flow_test.name_any(),
                format!("unsupported referenceFlow.kind '{kind}', expected Flow or ClusterFlow"),
            )
        })
    }

    /// Kind name as used in manifests
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flow => "Flow",
            Self::ClusterFlow => "ClusterFlow",
        }
    }
}

impl std::fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Flow or a ClusterFlow
#[derive(Clone, Debug)]
pub enum PipelineFlow {
    /// Namespaced flow
    Flow(Flow),
    /// Cluster flow
    ClusterFlow(ClusterFlow),
}

impl PipelineFlow {
    /// The flow's kind
    pub fn kind(&self) -> PipelineKind {
        match self {
            Self::Flow(_) => PipelineKind::Flow,
            Self::ClusterFlow(_) => PipelineKind::ClusterFlow,
        }
    }

    /// Object name
    pub fn name(&self) -> String {
        match self {
            Self::Flow(f) => f.name_any(),
            Self::ClusterFlow(f) => f.name_any(),
        }
    }

    /// Object namespace
    pub fn namespace(&self) -> Option<String> {
        match self {
            Self::Flow(f) => f.namespace(),
            Self::ClusterFlow(f) => f.namespace(),
        }
    }

    /// Object labels
    pub fn labels(&self) -> &BTreeMap<String, String> {
        match self {
            Self::Flow(f) => f.labels(),
            Self::ClusterFlow(f) => f.labels(),
        }
    }

    /// Ordered match rules
    pub fn matches(&self) -> &[Rule] {
        match self {
            Self::Flow(f) => &f.spec.matches,
            Self::ClusterFlow(f) => &f.spec.matches,
        }
    }

    /// Ordered filter stages
    pub fn filters(&self) -> &[Rule] {
        match self {
            Self::Flow(f) => &f.spec.filters,
            Self::ClusterFlow(f) => &f.spec.filters,
        }
    }

    /// Output references, local or global depending on kind
    pub fn output_refs(&self) -> &[String] {
        match self {
            Self::Flow(f) => &f.spec.local_output_refs,
            Self::ClusterFlow(f) => &f.spec.global_output_refs,
        }
    }

    /// False once the flow has been marked inactive
    pub fn is_active(&self) -> bool {
        let active = match self {
            Self::Flow(f) => f.status.as_ref().and_then(|s| s.active),
            Self::ClusterFlow(f) => f.status.as_ref().and_then(|s| s.active),
        };
        active != Some(false)
    }

    /// Slice kind from the `test-type` label, `None` for non-slice flows
    pub fn test_type(&self) -> Option<TestType> {
        self.labels()
            .get(TEST_TYPE_LABEL)
            .and_then(|v| TestType::from_label(v))
    }
}

/// An Output or a ClusterOutput
#[derive(Clone, Debug)]
pub enum PipelineOutput {
    /// Namespaced output
    Output(Output),
    /// Cluster output
    ClusterOutput(ClusterOutput),
}

impl PipelineOutput {
    /// Object name
    pub fn name(&self) -> String {
        match self {
            Self::Output(o) => o.name_any(),
            Self::ClusterOutput(o) => o.name_any(),
        }
    }

    /// Object namespace
    pub fn namespace(&self) -> Option<String> {
        match self {
            Self::Output(o) => o.namespace(),
            Self::ClusterOutput(o) => o.namespace(),
        }
    }

    /// HTTP endpoint the output posts to
    pub fn endpoint(&self) -> Option<&str> {
        let http = match self {
            Self::Output(o) => o.spec.http.as_ref(),
            Self::ClusterOutput(o) => o.spec.output.http.as_ref(),
        };
        http.map(|h| h.endpoint.as_str())
    }
}
