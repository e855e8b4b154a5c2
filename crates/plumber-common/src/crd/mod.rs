//! Custom Resource Definitions
//!
//! `FlowTest` is owned by this operator. The logging-operator kinds in
//! [`logging`] are consumed and created, never installed.

mod flowtest;
pub mod logging;

pub use flowtest::{FlowTest, FlowTestPhase, FlowTestSpec, FlowTestStatus, ReferenceObject};
pub use logging::{
    Buffer, ClusterFlow, ClusterFlowSpec, ClusterOutput, ClusterOutputSpec, Flow, FlowSpec,
    FlowStatus, HttpOutput, Output, OutputSpec, Rule,
};
