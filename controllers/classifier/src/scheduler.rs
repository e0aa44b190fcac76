//! Evaluation scheduler.
//!
//! Drains the job queue every tick, evaluates each queued classifier at most
//! once, and drives the report reconciler and (when enabled) the forwarder.
//! Transient failures re-queue the classifier at the tail and leave its
//! report untouched; a malformed rule is surfaced as match=false instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::ClusterAccess;
use crate::error::AgentError;
use crate::evaluator;
use crate::forwarder::ReportForwarder;
use crate::queue::JobQueue;
use crate::report::ReportReconciler;
use crds::Classifier;

pub struct Scheduler {
    access: ClusterAccess,
    queue: Arc<JobQueue>,
    reconciler: ReportReconciler,
    forwarder: Option<ReportForwarder>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        access: ClusterAccess,
        queue: Arc<JobQueue>,
        reconciler: ReportReconciler,
        forwarder: Option<ReportForwarder>,
        interval: Duration,
    ) -> Self {
        Self {
            access,
            queue,
            reconciler,
            forwarder,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                info!("scheduler stopping");
                return;
            }

            for name in self.queue.drain() {
                // Cancellation lands between rules, never mid-rule
                if *shutdown.borrow() {
                    info!("scheduler stopping");
                    return;
                }
                if let Err(e) = self.evaluate_one(&name).await {
                    if e.is_fatal_for_rule() {
                        warn!(classifier = %name, error = %e, "malformed classifier; reporting no match");
                        if let Err(e) = self.report_malformed(&name).await {
                            warn!(classifier = %name, error = %e, "failed to record malformed classifier; requeued");
                            self.queue.push(&name);
                        }
                    } else {
                        debug!(classifier = %name, error = %e, "evaluation failed; requeued");
                        self.queue.push(&name);
                    }
                }
            }
        }
    }

    /// Evaluate one queued classifier. A deleted classifier takes its report
    /// with it.
    async fn evaluate_one(&self, name: &str) -> Result<(), AgentError> {
        let Some(classifier) = self.access.classifiers().get_opt(name).await? else {
            debug!(classifier = %name, "classifier gone; removing report");
            return self.reconciler.clean_report(name).await;
        };

        let is_match = self.evaluate_match(&classifier).await?;
        info!(classifier = %name, matched = is_match, "evaluated");

        self.reconciler.upsert_report(&classifier, is_match).await?;
        if let Some(forwarder) = &self.forwarder {
            forwarder.forward(&classifier).await?;
        }
        Ok(())
    }

    /// Version predicate AND every resource predicate; each is vacuously
    /// true on an empty constraint list.
    async fn evaluate_match(&self, classifier: &Classifier) -> Result<bool, AgentError> {
        let constraints = &classifier.spec.kubernetes_version_constraints;
        if !constraints.is_empty() {
            // One version lookup per evaluation
            let cluster = self.access.cluster_version().await?;
            if !evaluator::version_matches(&cluster, constraints)? {
                return Ok(false);
            }
        }

        for constraint in &classifier.spec.deployed_resource_constraints {
            let gvk = constraint.group_version_kind();
            let Some((ar, namespaced)) = self.access.find_api_resource(&gvk).await? else {
                // Uninstalled kind: the constraint cannot be satisfied until
                // its CRD appears and the agent restarts
                debug!(kind = %gvk.kind, "kind not installed; constraint fails");
                return Ok(false);
            };
            let objects = self
                .access
                .list_resources(&ar, namespaced, constraint.scope_namespace())
                .await?;
            if !evaluator::resource_matches(&objects, constraint) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// A malformed rule is surfaced as match=false with its delivery phase
    /// left untouched; the rule is not retried until it changes again.
    async fn report_malformed(&self, name: &str) -> Result<(), AgentError> {
        if let Some(classifier) = self.access.classifiers().get_opt(name).await? {
            self.reconciler.mark_not_matching(&classifier).await?;
        }
        Ok(())
    }
}
