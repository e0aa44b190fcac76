//! Agent-specific error types.
//!
//! One error enum for the whole agent, plus predicates that classify
//! Kubernetes API failures the scheduler and forwarder care about.

use thiserror::Error;

/// Errors that can occur in the classifier agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Management cluster kubeconfig secret missing or malformed
    #[error("management kubeconfig error: {0}")]
    Kubeconfig(String),

    /// No node available to read the cluster Kubernetes version from
    #[error("no node available to determine cluster version")]
    NoNodeAvailable,

    /// A version string did not parse as a semantic version
    #[error("invalid semantic version: {0}")]
    InvalidVersion(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("resource watch failed: {0}")]
    Watch(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// True for malformed-rule errors, which are surfaced on the report
    /// instead of being retried. Everything else is treated as transient.
    pub fn is_fatal_for_rule(&self) -> bool {
        matches!(self, AgentError::InvalidVersion(_))
    }
}

/// True when the API server answered 404.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// True when a create failed because the object is already there.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists")
}

/// True when an update lost a resourceVersion race.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409 && resp.reason == "Conflict")
}
