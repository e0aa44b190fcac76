//! Report forwarding to the management cluster.
//!
//! Walks each undelivered local report through Delivering to Processed
//! around an idempotent upsert of the remote copy. A failure at any step
//! leaves the report in Delivering and the next tick retries, so a remote
//! observer only ever sees the previous verdict or the current one.

use kube::api::{Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::Api;
use serde_json::json;
use tracing::{debug, info};

use crate::client::ClusterAccess;
use crate::error::{is_already_exists, is_conflict, AgentError};
use crds::{
    Classifier, ClassifierReport, ClassifierReportSpec, ClassifierReportStatus, ClusterType,
    ReportPhase, CLASSIFIER_NAME_LABEL, CLUSTER_NAME_LABEL, CLUSTER_TYPE_LABEL,
};

/// Bound on resourceVersion races per phase transition.
const PHASE_CAS_ATTEMPTS: usize = 3;

pub struct ReportForwarder {
    access: ClusterAccess,
    cluster_namespace: String,
    cluster_name: String,
    cluster_type: ClusterType,
}

impl ReportForwarder {
    pub fn new(
        access: ClusterAccess,
        cluster_namespace: String,
        cluster_name: String,
        cluster_type: ClusterType,
    ) -> Self {
        Self {
            access,
            cluster_namespace,
            cluster_name,
            cluster_type,
        }
    }

    /// Copy the classifier's local report to the management cluster.
    /// A report already in Processed is left alone.
    pub async fn forward(&self, classifier: &Classifier) -> Result<(), AgentError> {
        let name = classifier
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| AgentError::InvalidConfig("classifier has no name".to_string()))?;
        let api = self.access.reports();

        let Some(report) = api.get_opt(name).await? else {
            return Ok(());
        };
        if report.status.as_ref().and_then(|status| status.phase) == Some(ReportPhase::Processed) {
            debug!(classifier = %name, "report already processed");
            return Ok(());
        }

        let report = self.set_phase(&api, report, ReportPhase::Delivering).await?;
        self.upsert_remote(&report).await?;
        self.set_phase(&api, report, ReportPhase::Processed).await?;
        info!(classifier = %name, "report delivered");
        Ok(())
    }

    /// Compare-and-set the phase via replace_status: the carried
    /// resourceVersion makes the API server reject stale writes, and a
    /// conflict re-reads and retries up to the bound.
    async fn set_phase(
        &self,
        api: &Api<ClassifierReport>,
        mut report: ClassifierReport,
        phase: ReportPhase,
    ) -> Result<ClassifierReport, AgentError> {
        let name = report
            .metadata
            .name
            .clone()
            .ok_or_else(|| AgentError::InvalidConfig("report has no name".to_string()))?;

        let mut attempt = 0;
        loop {
            report.status = Some(ClassifierReportStatus { phase: Some(phase) });
            report.metadata.managed_fields = None;

            match api
                .replace_status(&name, &PostParams::default(), serde_json::to_vec(&report)?)
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(e) if is_conflict(&e) && attempt + 1 < PHASE_CAS_ATTEMPTS => {
                    attempt += 1;
                    report = api.get(&name).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Idempotent upsert of the remote copy under its deterministic name.
    async fn upsert_remote(&self, local: &ClassifierReport) -> Result<(), AgentError> {
        let remote = build_remote_report(
            &self.cluster_namespace,
            &self.cluster_name,
            self.cluster_type,
            &local.spec.classifier_name,
            local.spec.is_match,
        );
        let remote_name = remote
            .metadata
            .name
            .clone()
            .ok_or_else(|| AgentError::InvalidConfig("remote report has no name".to_string()))?;

        let client = self.access.management_client().await?;
        let api: Api<ClassifierReport> = Api::namespaced(client, &self.cluster_namespace);

        match api.create(&PostParams::default(), &remote).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => {
                let patch = json!({
                    "metadata": {"labels": remote.metadata.labels},
                    "spec": remote.spec,
                });
                api.patch(&remote_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn build_remote_report(
    cluster_namespace: &str,
    cluster_name: &str,
    cluster_type: ClusterType,
    classifier_name: &str,
    is_match: bool,
) -> ClassifierReport {
    let labels = [
        (CLASSIFIER_NAME_LABEL.to_string(), classifier_name.to_string()),
        (CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string()),
        (
            CLUSTER_TYPE_LABEL.to_string(),
            cluster_type.as_str().to_lowercase(),
        ),
    ]
    .into_iter()
    .collect();

    ClassifierReport {
        metadata: ObjectMeta {
            name: Some(crds::report_name(classifier_name, cluster_name, cluster_type)),
            namespace: Some(cluster_namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: ClassifierReportSpec {
            classifier_name: classifier_name.to_string(),
            is_match,
            cluster_namespace: Some(cluster_namespace.to_string()),
            cluster_name: Some(cluster_name.to_string()),
            cluster_type: Some(cluster_type),
        },
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_report_uses_the_deterministic_name() {
        let report = build_remote_report("mgmt", "prod-eu", ClusterType::Capi, "ha-cluster", true);

        assert_eq!(
            report.metadata.name.as_deref(),
            Some("capi--prod-eu--ha-cluster")
        );
        assert_eq!(report.metadata.namespace.as_deref(), Some("mgmt"));
    }

    #[test]
    fn remote_report_carries_cluster_identity() {
        let report = build_remote_report("mgmt", "prod-eu", ClusterType::Capi, "ha-cluster", true);

        assert_eq!(report.spec.cluster_namespace.as_deref(), Some("mgmt"));
        assert_eq!(report.spec.cluster_name.as_deref(), Some("prod-eu"));
        assert_eq!(report.spec.cluster_type, Some(ClusterType::Capi));
        assert!(report.spec.is_match);
    }

    #[test]
    fn remote_labels_lowercase_the_cluster_type() {
        let report =
            build_remote_report("mgmt", "prod-eu", ClusterType::Sveltos, "ha-cluster", false);
        let labels = report.metadata.labels.unwrap();

        assert_eq!(labels[CLASSIFIER_NAME_LABEL], "ha-cluster");
        assert_eq!(labels[CLUSTER_NAME_LABEL], "prod-eu");
        assert_eq!(labels[CLUSTER_TYPE_LABEL], "sveltos");
    }
}
