//! Slice verification
//!
//! A slice passes when the aggregator holds a non-empty index named after it.
//! Passing slices are retired according to the configured policy and the
//! reference entries they exercised are marked in the FlowTest status.

use kube::ResourceExt;
use tracing::{debug, info, warn};

use plumber_common::crd::{FlowTest, Rule};
use plumber_common::labels::{flow_test_selector, TestType};
use plumber_common::{Error, Result};

use crate::client::KubeClient;
use crate::config::SlicePassPolicy;
use crate::index::{has_logs, LogIndex};
use crate::pipeline::{PipelineFlow, PipelineKind};

/// Result of one verification pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Verification {
    /// Match rule pass flags after this pass
    pub match_status: Vec<bool>,
    /// Filter stage pass flags after this pass
    pub filter_status: Vec<bool>,
    /// Slices that passed during this pass
    pub passed: Vec<String>,
}

impl Verification {
    /// True when every tracked entry has passed
    pub fn all_passed(&self) -> bool {
        self.match_status.iter().chain(&self.filter_status).all(|p| *p)
    }
}

/// Mark the reference entries exercised by a passing slice
///
/// Each slice rule marks the first structurally equal reference entry not
/// already claimed by an earlier rule of the same slice. Entries outside the
/// tracked range are ignored. Returns how many flags flipped.
pub fn mark_passed(flags: &mut [bool], reference: &[Rule], slice_rules: &[Rule]) -> usize {
    let mut claimed = vec![false; reference.len()];
    let mut flipped = 0;
    for rule in slice_rules {
        let Some(i) = (0..reference.len()).find(|&i| !claimed[i] && reference[i] == *rule) else {
            continue;
        };
        claimed[i] = true;
        if let Some(flag) = flags.get_mut(i) {
            if !*flag {
                *flag = true;
                flipped += 1;
            }
        }
    }
    flipped
}

async fn retire(
    kube: &dyn KubeClient,
    slice: &PipelineFlow,
    policy: SlicePassPolicy,
) -> Result<()> {
    match policy {
        SlicePassPolicy::Delete => kube.delete_flow(slice).await,
        SlicePassPolicy::Deactivate => kube.deactivate_flow(slice).await,
    }
}

/// Run one verification pass
///
/// Status is written once, at the end, and only when a flag changed. If
/// retiring a slice fails the pass stops there, flags gathered so far are
/// still persisted and the error is returned.
pub async fn verify(
    flow_test: &FlowTest,
    kube: &dyn KubeClient,
    index: &dyn LogIndex,
    policy: SlicePassPolicy,
) -> Result<Verification> {
    let name = flow_test.name_any();
    let kind = PipelineKind::of(flow_test)?;
    let flow_ref = &flow_test.spec.reference_flow;

    let reference = kube
        .get_flow(kind, &flow_ref.namespace, &flow_ref.name)
        .await?
        .ok_or_else(|| {
            Error::validation_for(
                &name,
                format!("reference {kind} {}/{} not found", flow_ref.namespace, flow_ref.name),
            )
        })?;
    let slices = kube.list_flows(kind, &flow_test_selector(&name)).await?;
    let indexes = index.list_indexes().await?;

    let status = flow_test.status.clone().unwrap_or_default();
    let mut outcome = Verification {
        match_status: status.match_status,
        filter_status: status.filter_status,
        passed: Vec::new(),
    };
    let mut flipped = 0;
    let mut failure = None;

    for slice in slices.iter().filter(|s| s.is_active()) {
        let slice_name = slice.name();
        let Some(test_type) = slice.test_type() else {
            debug!(flowtest = %name, slice = %slice_name, "flow has no test-type label, skipping");
            continue;
        };
        if !has_logs(&indexes, &slice_name) {
            continue;
        }

        if let Err(e) = retire(kube, slice, policy).await {
            warn!(
                flowtest = %name,
                slice = %slice_name,
                error = %e,
                "failed to retire passing slice"
            );
            failure = Some(e);
            break;
        }

        flipped += match test_type {
            TestType::Match => mark_passed(
                &mut outcome.match_status,
                reference.matches(),
                slice.matches(),
            ),
            TestType::Filter => mark_passed(
                &mut outcome.filter_status,
                reference.filters(),
                slice.filters(),
            ),
        };
        info!(flowtest = %name, slice = %slice_name, %test_type, "slice passed");
        outcome.passed.push(slice_name);
    }

    if flipped > 0 {
        let mut updated = flow_test.status.clone().unwrap_or_default();
        updated.match_status = outcome.match_status.clone();
        updated.filter_status = outcome.filter_status.clone();
        kube.patch_status(flow_test, &updated).await?;
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(outcome),
    }
}
