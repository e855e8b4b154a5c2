//! Resource cleanup
//!
//! Per-test objects are found by the FlowTest name label and removed kind by
//! kind, flows before the outputs they route to. The shared aggregator is
//! only removed once every FlowTest is Completed and none is being deleted.

use kube::ResourceExt;
use tracing::{debug, info};

use plumber_common::crd::{FlowTest, FlowTestPhase};
use plumber_common::labels::{aggregator_selector, flow_test_selector};
use plumber_common::Result;

use crate::client::{KubeClient, OwnedKind};

/// Kinds created per FlowTest, in deletion order
pub const TEST_RESOURCE_KINDS: [OwnedKind; 6] = [
    OwnedKind::Flow,
    OwnedKind::ClusterFlow,
    OwnedKind::Output,
    OwnedKind::ClusterOutput,
    OwnedKind::Pod,
    OwnedKind::ConfigMap,
];

/// Kinds making up the shared aggregator
pub const AGGREGATOR_KINDS: [OwnedKind; 2] = [OwnedKind::Pod, OwnedKind::Service];

/// Outcome of a cleanup run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Per-test objects deleted
    pub test_resources: usize,
    /// Whether the aggregator teardown ran
    pub aggregator_removed: bool,
}

impl CleanupReport {
    /// True when the run deleted something
    pub fn changed(&self) -> bool {
        self.test_resources > 0 || self.aggregator_removed
    }
}

/// Delete every object labeled as belonging to the named FlowTest
///
/// Safe to repeat: a second run finds nothing and deletes nothing.
pub async fn cleanup_test_resources(kube: &dyn KubeClient, flow_test: &str) -> Result<usize> {
    let selector = flow_test_selector(flow_test);
    let mut deleted = 0;
    for kind in TEST_RESOURCE_KINDS {
        let n = kube.delete_labeled(kind, &selector).await?;
        if n > 0 {
            debug!(flowtest = %flow_test, %kind, count = n, "deleted test resources");
        }
        deleted += n;
    }
    Ok(deleted)
}

/// Whether any FlowTest may still use the aggregator
///
/// Every listed FlowTest counts, the one being reconciled included. A
/// FlowTest keeps the aggregator alive unless it is Completed and not being
/// deleted.
pub fn aggregator_in_use(flow_tests: &[FlowTest]) -> bool {
    flow_tests
        .iter()
        .any(|ft| ft.phase() != Some(FlowTestPhase::Completed) || ft.is_deleting())
}

/// Delete the shared aggregator if no FlowTest needs it
///
/// Returns whether the teardown ran.
pub async fn teardown_aggregator(kube: &dyn KubeClient, current: &FlowTest) -> Result<bool> {
    let flow_tests = kube.list_flow_tests().await?;
    if aggregator_in_use(&flow_tests) {
        debug!(flowtest = %current.name_any(), "aggregator still in use, keeping it");
        return Ok(false);
    }

    let selector = aggregator_selector();
    for kind in AGGREGATOR_KINDS {
        kube.delete_labeled(kind, &selector).await?;
    }
    info!(flowtest = %current.name_any(), "removed shared log aggregator");
    Ok(true)
}

/// Per-test cleanup followed by the aggregator teardown check
pub async fn cleanup(kube: &dyn KubeClient, flow_test: &FlowTest) -> Result<CleanupReport> {
    let test_resources = cleanup_test_resources(kube, &flow_test.name_any()).await?;
    let aggregator_removed = teardown_aggregator(kube, flow_test).await?;
    Ok(CleanupReport {
        test_resources,
        aggregator_removed,
    })
}
