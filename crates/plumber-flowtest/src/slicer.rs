//! Flow slicing
//!
//! A reference pipeline with `m` match rules and `f` filter stages becomes
//! `m + f` independently routed test pipelines:
//!
//! - match slice `i` keeps only match rule `i` and the UID grep filter, so it
//!   delivers iff that rule alone selects the simulation pod
//! - filter slice `x` selects the simulation pod by label and applies the
//!   first `x` filter stages, so it delivers iff records survive that prefix
//!
//! Test ids run across both kinds (matches first) and are unique per FlowTest.

use std::collections::BTreeMap;

use tracing::debug;

use plumber_common::crd::Rule;
use plumber_common::labels::{slice_labels, Owner, TestType};
use plumber_common::Result;

use crate::client::KubeClient;
use crate::pipeline::{PipelineFlow, PipelineOutput};
use crate::template::SliceTemplate;

/// One test pipeline
#[derive(Clone, Debug)]
pub struct Slice {
    /// Object name of both the flow and the output
    pub name: String,
    /// Sequence number within the FlowTest
    pub test_id: usize,
    /// Which reference entries the slice exercises
    pub test_type: TestType,
    /// The slice flow
    pub flow: PipelineFlow,
    /// The slice's dedicated output
    pub output: PipelineOutput,
}

/// Deterministic slice name
pub fn slice_name(uid: &str, test_id: usize, test_type: TestType) -> String {
    format!("{uid}-{test_id}-{test_type}")
}

/// Expand `reference` into its match and filter slices
///
/// `simulation_labels` are the labels of the simulation pod; filter slices
/// select on them so match rules play no part in filter results.
pub fn plan_slices(
    reference: &PipelineFlow,
    owner: Owner<'_>,
    simulation_labels: &BTreeMap<String, String>,
    endpoint_base: &str,
) -> Result<Vec<Slice>> {
    let template = SliceTemplate::new(reference, owner, endpoint_base)?;
    let reference_matches = reference.matches();
    let reference_filters = reference.filters();

    let mut slices = Vec::with_capacity(reference_matches.len() + reference_filters.len());
    let mut next_id = 0;

    for rule in reference_matches {
        slices.push(build_slice(
            &template,
            owner,
            next_id,
            TestType::Match,
            vec![rule.clone()],
            &[],
        ));
        next_id += 1;
    }

    let select_simulation = Rule::select_labels(simulation_labels);
    for prefix in 1..=reference_filters.len() {
        slices.push(build_slice(
            &template,
            owner,
            next_id,
            TestType::Filter,
            vec![select_simulation.clone()],
            &reference_filters[..prefix],
        ));
        next_id += 1;
    }

    Ok(slices)
}

fn build_slice(
    template: &SliceTemplate,
    owner: Owner<'_>,
    test_id: usize,
    test_type: TestType,
    matches: Vec<Rule>,
    filters: &[Rule],
) -> Slice {
    let name = slice_name(owner.uid, test_id, test_type);
    let labels = slice_labels(&template.reference_name, owner, test_id, test_type);
    Slice {
        flow: template.flow(&name, &labels, matches, filters),
        output: template.output(&name, &labels),
        name,
        test_id,
        test_type,
    }
}

/// Create every slice, each output before its flow
///
/// Stops at the first failure; already-created slices are left for cleanup.
pub async fn deploy_slices(kube: &dyn KubeClient, slices: &[Slice]) -> Result<()> {
    for slice in slices {
        kube.create_output(&slice.output).await?;
        kube.create_flow(&slice.flow).await?;
        debug!(slice = %slice.name, test_type = %slice.test_type, "deployed slice");
    }
    Ok(())
}
