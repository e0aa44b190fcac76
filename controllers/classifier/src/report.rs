//! ClassifierReport reconciliation (local cluster).
//!
//! One report per classifier, named after it, in the report namespace. The
//! verdict lives in spec, the delivery phase in status; the phase resets to
//! WaitingForDelivery whenever the verdict changes or a processed report
//! needs re-delivery.

use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::Api;
use serde_json::json;
use tracing::debug;

use crate::client::ClusterAccess;
use crate::error::{is_not_found, AgentError};
use crds::{
    Classifier, ClassifierReport, ClassifierReportSpec, ReportPhase, CLASSIFIER_NAME_LABEL,
    REPORT_NAMESPACE,
};

pub struct ReportReconciler {
    access: ClusterAccess,
}

impl ReportReconciler {
    pub fn new(access: ClusterAccess) -> Self {
        Self { access }
    }

    /// Create or update the classifier's local report with the verdict.
    pub async fn upsert_report(
        &self,
        classifier: &Classifier,
        is_match: bool,
    ) -> Result<(), AgentError> {
        let name = classifier
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| AgentError::InvalidConfig("classifier has no name".to_string()))?;
        let api = self.access.reports();

        match api.get_opt(name).await? {
            None => self.create_report(&api, name, is_match).await,
            Some(existing) => self.update_report(&api, name, &existing, is_match).await,
        }
    }

    async fn create_report(
        &self,
        api: &Api<ClassifierReport>,
        name: &str,
        is_match: bool,
    ) -> Result<(), AgentError> {
        debug!(classifier = %name, matched = is_match, "creating report");
        api.create(&PostParams::default(), &local_report(name, is_match))
            .await?;
        // Status is a subresource; the phase lands in a second write.
        self.patch_phase(api, name, ReportPhase::WaitingForDelivery)
            .await
    }

    async fn update_report(
        &self,
        api: &Api<ClassifierReport>,
        name: &str,
        existing: &ClassifierReport,
        is_match: bool,
    ) -> Result<(), AgentError> {
        debug!(classifier = %name, matched = is_match, "updating report");
        let patch = json!({
            "metadata": {"labels": {(CLASSIFIER_NAME_LABEL): name}},
            "spec": {"classifierName": name, "match": is_match},
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        let stored_phase = existing.status.as_ref().and_then(|status| status.phase);
        if let Some(next) = phase_after_update(stored_phase, existing.spec.is_match, is_match) {
            self.patch_phase(api, name, next).await?;
        }
        Ok(())
    }

    async fn patch_phase(
        &self,
        api: &Api<ClassifierReport>,
        name: &str,
        phase: ReportPhase,
    ) -> Result<(), AgentError> {
        let status = json!({"status": {"phase": phase}});
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status))
            .await?;
        Ok(())
    }

    /// Record a malformed classifier as not matching. The verdict is
    /// rewritten without consulting `phase_after_update`, so the delivery
    /// phase stays exactly as it was while the rule is broken.
    pub async fn mark_not_matching(&self, classifier: &Classifier) -> Result<(), AgentError> {
        let name = classifier
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| AgentError::InvalidConfig("classifier has no name".to_string()))?;
        let api = self.access.reports();

        match api.get_opt(name).await? {
            None => self.create_report(&api, name, false).await,
            Some(_) => {
                debug!(classifier = %name, "recording no-match verdict; phase untouched");
                let patch = json!({
                    "metadata": {"labels": {(CLASSIFIER_NAME_LABEL): name}},
                    "spec": {"classifierName": name, "match": false},
                });
                api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
        }
    }

    /// Delete the report of a removed classifier. Not-found is success.
    pub async fn clean_report(&self, name: &str) -> Result<(), AgentError> {
        match self
            .access
            .reports()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                debug!(classifier = %name, "report removed");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn local_report(name: &str, is_match: bool) -> ClassifierReport {
    ClassifierReport {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(REPORT_NAMESPACE.to_string()),
            labels: Some(
                [(CLASSIFIER_NAME_LABEL.to_string(), name.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: ClassifierReportSpec {
            classifier_name: name.to_string(),
            is_match,
            cluster_namespace: None,
            cluster_name: None,
            cluster_type: None,
        },
        status: None,
    }
}

/// Phase to move an updated report to, if any.
///
/// Resets to WaitingForDelivery when the verdict changed or a processed
/// report must be re-delivered; an in-flight delivery is left alone.
fn phase_after_update(
    stored_phase: Option<ReportPhase>,
    stored_match: bool,
    new_match: bool,
) -> Option<ReportPhase> {
    if stored_match != new_match || stored_phase == Some(ReportPhase::Processed) || stored_phase.is_none()
    {
        Some(ReportPhase::WaitingForDelivery)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_change_resets_the_phase() {
        assert_eq!(
            phase_after_update(Some(ReportPhase::Delivering), true, false),
            Some(ReportPhase::WaitingForDelivery)
        );
        assert_eq!(
            phase_after_update(Some(ReportPhase::WaitingForDelivery), false, true),
            Some(ReportPhase::WaitingForDelivery)
        );
    }

    #[test]
    fn processed_report_is_requeued_for_delivery() {
        assert_eq!(
            phase_after_update(Some(ReportPhase::Processed), true, true),
            Some(ReportPhase::WaitingForDelivery)
        );
    }

    #[test]
    fn unchanged_verdict_leaves_delivery_in_flight() {
        assert_eq!(phase_after_update(Some(ReportPhase::Delivering), true, true), None);
        assert_eq!(
            phase_after_update(Some(ReportPhase::WaitingForDelivery), false, false),
            None
        );
    }

    #[test]
    fn missing_phase_is_restored() {
        assert_eq!(
            phase_after_update(None, true, true),
            Some(ReportPhase::WaitingForDelivery)
        );
    }

    #[test]
    fn local_report_carries_the_classifier_label() {
        let report = local_report("ha-cluster", true);

        assert_eq!(report.metadata.namespace.as_deref(), Some(REPORT_NAMESPACE));
        assert_eq!(report.metadata.name.as_deref(), Some("ha-cluster"));
        assert_eq!(
            report
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(CLASSIFIER_NAME_LABEL))
                .map(String::as_str),
            Some("ha-cluster")
        );
        assert!(report.spec.is_match);
        assert_eq!(report.spec.classifier_name, "ha-cluster");
    }
}
