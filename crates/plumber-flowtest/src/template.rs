//! Slice templates
//!
//! Every slice of a FlowTest shares the same namespace, ownership labels, UID
//! grep filter and output buffering. The template captures those once and
//! stamps out concrete Flow/Output pairs.

use std::collections::BTreeMap;

use kube::api::ObjectMeta;

use plumber_common::crd::{
    Buffer, ClusterFlow, ClusterFlowSpec, ClusterOutput, ClusterOutputSpec, Flow, FlowSpec,
    HttpOutput, Output, OutputSpec, Rule,
};
use plumber_common::labels::Owner;
use plumber_common::{Error, Result};

use crate::pipeline::{PipelineFlow, PipelineKind, PipelineOutput};

/// Record field the UID grep filter inspects
pub const GREP_KEY: &str = "kubernetes";

/// Buffer settings making slices deliver within seconds
pub fn fast_flush_buffer() -> Buffer {
    Buffer {
        flush_mode: Some("interval".to_string()),
        flush_interval: Some("1s".to_string()),
    }
}

/// Filter letting through only records produced by this test's simulation pod
pub fn uid_filter(uid: &str) -> Rule {
    Rule::grep_regexp(GREP_KEY, &format!(".*{uid}.*"))
}

/// Shared shape of every slice of one FlowTest
#[derive(Clone, Debug)]
pub struct SliceTemplate {
    /// Kind of the reference flow (and of every slice)
    pub kind: PipelineKind,
    /// Namespace slices are created in
    pub namespace: String,
    /// Name of the reference flow, used as `app.kubernetes.io/name`
    pub reference_name: String,
    /// Filters every slice starts with
    pub filters: Vec<Rule>,
    /// Aggregator base URL; slices append `/<slice-name>/`
    pub endpoint_base: String,
    /// Output buffer section
    pub buffer: Buffer,
}

impl SliceTemplate {
    /// Build the template for `reference` owned by `owner`
    pub fn new(reference: &PipelineFlow, owner: Owner<'_>, endpoint_base: &str) -> Result<Self> {
        let namespace = reference.namespace().ok_or_else(|| {
            Error::validation_for(
                owner.name,
                format!("reference {} {} has no namespace", reference.kind(), reference.name()),
            )
        })?;
        Ok(Self {
            kind: reference.kind(),
            namespace,
            reference_name: reference.name(),
            filters: vec![uid_filter(owner.uid)],
            endpoint_base: endpoint_base.trim_end_matches('/').to_string(),
            buffer: fast_flush_buffer(),
        })
    }

    /// Endpoint a slice's output posts to
    pub fn endpoint_for(&self, slice_name: &str) -> String {
        format!("{}/{slice_name}/", self.endpoint_base)
    }

    fn metadata(&self, name: &str, labels: &BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        }
    }

    /// Flow routing `matches` through the template filters followed by
    /// `filters` into the output of the same name
    pub fn flow(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        matches: Vec<Rule>,
        filters: &[Rule],
    ) -> PipelineFlow {
        let all_filters: Vec<Rule> = self.filters.iter().chain(filters).cloned().collect();
        let metadata = self.metadata(name, labels);
        match self.kind {
            PipelineKind::Flow => PipelineFlow::Flow(Flow {
                metadata,
                spec: FlowSpec {
                    matches,
                    filters: all_filters,
                    local_output_refs: vec![name.to_string()],
                    global_output_refs: vec![],
                },
                status: None,
            }),
            PipelineKind::ClusterFlow => PipelineFlow::ClusterFlow(ClusterFlow {
                metadata,
                spec: ClusterFlowSpec {
                    matches,
                    filters: all_filters,
                    global_output_refs: vec![name.to_string()],
                },
                status: None,
            }),
        }
    }

    /// HTTP output delivering to the slice's own aggregator index
    pub fn output(&self, name: &str, labels: &BTreeMap<String, String>) -> PipelineOutput {
        let plugin = OutputSpec {
            http: Some(HttpOutput {
                endpoint: self.endpoint_for(name),
                buffer: Some(self.buffer.clone()),
            }),
        };
        let metadata = self.metadata(name, labels);
        match self.kind {
            PipelineKind::Flow => PipelineOutput::Output(Output {
                metadata,
                spec: plugin,
            }),
            PipelineKind::ClusterFlow => PipelineOutput::ClusterOutput(ClusterOutput {
                metadata,
                spec: ClusterOutputSpec {
                    output: plugin,
                    enabled_namespaces: vec![],
                },
            }),
        }
    }
}
