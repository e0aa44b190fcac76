//! Classifier agent CRD definitions
//!
//! Kubernetes Custom Resource Definitions shared by the classifier agent:
//! - Classifier: a user-supplied rule over the cluster version and deployed
//!   resources
//! - ClassifierReport: the agent's per-rule verdict, locally and on the
//!   management cluster

pub mod classifier;
pub mod classifier_report;

// Re-exports
pub use classifier::*;
pub use classifier_report::*;
