//! Kubernetes Event recording for the FlowTest controller.
//!
//! Events are the user-facing surface of a FlowTest: `kubectl describe
//! flowtest` shows provisioning failures, passing slices and cleanup results.
//! Publishing is fire-and-forget; a failed event is logged and never breaks
//! reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `resource_ref`.
    ///
    /// `reason` is machine-readable (see [`reasons`]), `action` names what the
    /// controller was doing (see [`actions`]).
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    /// FlowTest accepted and finalizer attached
    pub const CREATED: &str = "Created";
    /// Simulation, aggregator and slices are in place
    pub const PROVISIONED: &str = "Provisioned";
    /// Provisioning failed, FlowTest moved to Error
    pub const PROVISION_FAILED: &str = "ProvisionFailed";
    /// A slice delivered logs to its output
    pub const SLICE_PASSED: &str = "SlicePassed";
    /// A verification pass could not complete
    pub const VERIFICATION_FAILED: &str = "VerificationFailed";
    /// All entries passed or the deadline was reached
    pub const COMPLETED: &str = "Completed";
    /// Test resources were removed
    pub const CLEANED_UP: &str = "CleanedUp";
    /// Test resources could not be removed yet
    pub const CLEANUP_FAILED: &str = "CleanupFailed";
}

/// Event actions, shown in the ACTION column of `kubectl get events`
pub mod actions {
    /// State machine bookkeeping
    pub const RECONCILE: &str = "Reconcile";
    /// Creating test infrastructure
    pub const PROVISION: &str = "Provision";
    /// Checking slices against the aggregator
    pub const VERIFY: &str = "Verify";
    /// Removing test infrastructure
    pub const CLEANUP: &str = "Cleanup";
}
