//! ClassifierReport CRD
//!
//! The agent's output for one Classifier: whether the cluster currently
//! matches, plus a delivery phase driven by the report forwarder.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Namespace local ClassifierReports are written to
pub const REPORT_NAMESPACE: &str = "projectsveltos";

/// Label carrying the owning classifier's name, on local and forwarded reports
pub const CLASSIFIER_NAME_LABEL: &str = "projectsveltos.io/classifier-name";

/// Label carrying the source cluster name, on forwarded reports only
pub const CLUSTER_NAME_LABEL: &str = "projectsveltos.io/cluster-name";

/// Label carrying the lower-cased cluster type, on forwarded reports only
pub const CLUSTER_TYPE_LABEL: &str = "projectsveltos.io/cluster-type";

/// Coordinates of the secret holding the management cluster kubeconfig
pub const AGENT_SECRET_NAMESPACE: &str = "projectsveltos";
pub const AGENT_SECRET_NAME: &str = "classifier-agent";
pub const AGENT_SECRET_KEY: &str = "data";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "lib.projectsveltos.io",
    version = "v1alpha1",
    kind = "ClassifierReport",
    namespaced,
    status = "ClassifierReportStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierReportSpec {
    /// Name of the Classifier this report is for
    pub classifier_name: String,

    /// Whether the cluster satisfied the classifier at evaluation time
    #[serde(rename = "match")]
    pub is_match: bool,

    /// Namespace of the source cluster, set on forwarded reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_namespace: Option<String>,

    /// Name of the source cluster, set on forwarded reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    /// Type of the source cluster, set on forwarded reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_type: Option<ClusterType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierReportStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ReportPhase>,
}

/// Delivery lifecycle of a report
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ReportPhase {
    /// Evaluated locally, not yet picked up by the forwarder
    WaitingForDelivery,
    /// Forwarder is copying the report to the management cluster
    Delivering,
    /// Delivered; re-forwarding is a no-op until the verdict changes
    Processed,
}

/// Kind of cluster the agent runs in, as registered with the management cluster
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterType {
    Capi,
    Sveltos,
}

impl ClusterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Capi => "Capi",
            ClusterType::Sveltos => "Sveltos",
        }
    }
}

impl std::fmt::Display for ClusterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClusterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Capi" | "capi" => Ok(ClusterType::Capi),
            "Sveltos" | "sveltos" => Ok(ClusterType::Sveltos),
            other => Err(format!("unknown cluster type: {other}")),
        }
    }
}

/// Deterministic name of the forwarded copy of a report.
///
/// The same (classifier, cluster, type) triple always maps to the same name
/// so the forwarder can upsert instead of tracking identity.
pub fn report_name(classifier_name: &str, cluster_name: &str, cluster_type: ClusterType) -> String {
    format!(
        "{}--{}--{}",
        cluster_type.as_str().to_lowercase(),
        cluster_name,
        classifier_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_name_is_deterministic_and_lowercases_type() {
        let name = report_name("ha-cluster", "prod-eu", ClusterType::Capi);
        assert_eq!(name, "capi--prod-eu--ha-cluster");
        assert_eq!(name, report_name("ha-cluster", "prod-eu", ClusterType::Capi));
    }

    #[test]
    fn match_field_serializes_under_wire_name() {
        let spec = ClassifierReportSpec {
            classifier_name: "ha-cluster".to_string(),
            is_match: true,
            cluster_namespace: None,
            cluster_name: None,
            cluster_type: None,
        };
        let v = serde_json::to_value(&spec).unwrap();
        assert_eq!(v["match"], serde_json::json!(true));
        assert_eq!(v["classifierName"], serde_json::json!("ha-cluster"));
    }

    #[test]
    fn cluster_type_parses_both_cases() {
        assert_eq!("Capi".parse::<ClusterType>().unwrap(), ClusterType::Capi);
        assert_eq!("sveltos".parse::<ClusterType>().unwrap(), ClusterType::Sveltos);
        assert!("openshift".parse::<ClusterType>().is_err());
    }
}
