//! Common types for the logging pipeline plumber: CRDs, labels, errors and events

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod labels;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name of the shared log aggregator Pod and Service
pub const AGGREGATOR_NAME: &str = "logging-plumber-log-aggregator";

/// Field manager used for every patch issued by the controller
pub const FIELD_MANAGER: &str = "logging-pipeline-plumber";
