//! Classifier CRD
//!
//! A declarative rule combining Kubernetes version constraints and
//! deployed-resource constraints. Cluster scoped; the agent evaluates every
//! Classifier against the cluster it runs in.

use kube::core::GroupVersionKind;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "lib.projectsveltos.io",
    version = "v1alpha1",
    kind = "Classifier"
)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierSpec {
    /// Labels carried on the ClassifierReport when the cluster is a match.
    /// Not used for matching.
    pub classifier_labels: Vec<ClassifierLabel>,

    /// Constraints on the cluster Kubernetes version. All must hold.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kubernetes_version_constraints: Vec<KubernetesVersionConstraint>,

    /// Constraints on resources deployed in the cluster. All must hold.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployed_resource_constraints: Vec<DeployedResourceConstraint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierLabel {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesVersionConstraint {
    /// Semantic version, with or without a leading `v` (e.g. `v1.25.0`)
    pub version: String,

    pub comparison: Comparison,
}

/// Comparison operator for Kubernetes version constraints
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqualTo,
    LessThan,
    LessThanOrEqualTo,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeployedResourceConstraint {
    /// API group of the resource kind. Empty for the core group.
    #[serde(default)]
    pub group: String,

    pub version: String,

    pub kind: String,

    /// Namespace to count resources in. Absent or empty means cluster-wide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Minimum number of matching resources (inclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<i32>,

    /// Maximum number of matching resources (inclusive)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<i32>,

    /// Label filters a resource must satisfy to be counted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_filters: Vec<LabelFilter>,

    /// Field filters (dotted JSON paths) a resource must satisfy to be counted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_filters: Vec<FieldFilter>,
}

impl DeployedResourceConstraint {
    pub fn group_version_kind(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    /// Namespace to list in, with empty string normalized to cluster-wide.
    pub fn scope_namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }
}

/// Filter operator shared by label and field filters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum FilterOperation {
    Equal,
    Different,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabelFilter {
    pub key: String,
    pub operation: FilterOperation,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldFilter {
    /// Dotted path into the resource document, e.g. `status.podIP`
    pub field: String,
    pub operation: FilterOperation,
    pub value: String,
}
