//! FlowTest controller
//!
//! Reconciles FlowTest resources through a state machine:
//! (unset) → Created → Running → Completed, with Error reachable while
//! provisioning and deletion short-circuiting to cleanup.
//!
//! - [`provision`] creates the simulation pod, its ConfigMap and the shared
//!   log aggregator
//! - [`slicer`] expands the reference pipeline into independently routed slices
//! - [`verify`] marks entries as passed once their slice delivered logs
//! - [`cleanup`] removes per-test resources and, when idle, the aggregator

pub mod cleanup;
pub mod client;
pub mod config;
pub mod controller;
pub mod index;
pub mod pipeline;
pub mod provision;
pub mod slicer;
pub mod template;
pub mod verify;

#[cfg(test)]
mod fake;

pub use client::{KubeClient, KubeClientImpl};
pub use config::{ControllerConfig, Image, SlicePassPolicy};
pub use controller::{error_policy, reconcile, Context, FLOWTEST_FINALIZER};
pub use index::{AggregatorClient, Index, LogIndex};
