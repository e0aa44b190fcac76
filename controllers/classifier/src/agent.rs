//! Process supervision.
//!
//! Wires the shared handles once at boot - there is exactly one queue and
//! one registry per process, created here and passed to every task - and
//! owns the long-running tasks: scheduler, watch-set rebuilder, Classifier
//! watch, and the CustomResourceDefinition watch that restarts the agent
//! when a parked kind becomes available.

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::GroupVersionKind;
use kube::runtime::watcher::{self, Event};
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backoff::FibonacciBackoff;
use crate::client::ClusterAccess;
use crate::error::AgentError;
use crate::forwarder::ReportForwarder;
use crate::queue::JobQueue;
use crate::registry::WatchRegistry;
use crate::report::ReportReconciler;
use crate::scheduler::Scheduler;
use crds::ClusterType;

pub struct AgentConfig {
    pub interval: Duration,
    pub send_report: bool,
    pub cluster_namespace: String,
    pub cluster_name: String,
    pub cluster_type: ClusterType,
}

pub struct Agent {
    access: ClusterAccess,
    queue: Arc<JobQueue>,
    registry: Arc<WatchRegistry>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(client: Client, config: AgentConfig) -> Self {
        let access = ClusterAccess::new(client);
        let queue = Arc::new(JobQueue::default());
        let registry = Arc::new(WatchRegistry::new(queue.clone()));
        Self {
            access,
            queue,
            registry,
            config,
        }
    }

    /// Run until SIGTERM/interrupt. SIGTERM is also what the CRD watch
    /// raises at this process when a parked kind lands.
    pub async fn run(self) -> Result<(), AgentError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let forwarder = self.config.send_report.then(|| {
            ReportForwarder::new(
                self.access.clone(),
                self.config.cluster_namespace.clone(),
                self.config.cluster_name.clone(),
                self.config.cluster_type,
            )
        });
        let scheduler = Scheduler::new(
            self.access.clone(),
            self.queue.clone(),
            ReportReconciler::new(self.access.clone()),
            forwarder,
            self.config.interval,
        );

        let mut scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));
        let mut rebuild_task = tokio::spawn(
            self.registry
                .clone()
                .run(self.access.clone(), shutdown_rx.clone()),
        );
        let mut classifier_task = tokio::spawn(watch_classifiers(
            self.access.clone(),
            self.queue.clone(),
            self.registry.clone(),
        ));
        let mut crd_task = tokio::spawn(watch_custom_resource_definitions(
            self.access.clone(),
            self.registry.clone(),
        ));

        // Pick up whatever rules exist before the first watch event lands
        self.registry.mark_rebuild();

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received; shutting down");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; shutting down");
            }
            result = &mut scheduler_task => {
                return Err(task_exit("scheduler", result));
            }
            result = &mut rebuild_task => {
                return Err(task_exit("watch-set rebuilder", result));
            }
            result = &mut classifier_task => {
                return Err(task_exit("Classifier watch", result));
            }
            result = &mut crd_task => {
                return Err(task_exit("CustomResourceDefinition watch", result));
            }
        }

        let _ = shutdown_tx.send(true);
        classifier_task.abort();
        crd_task.abort();
        let _ = scheduler_task.await;
        let _ = rebuild_task.await;
        Ok(())
    }
}

// The long-running tasks never return under normal operation.
fn task_exit(task: &str, result: Result<(), tokio::task::JoinError>) -> AgentError {
    match result {
        Ok(()) => AgentError::Watch(format!("{task} exited unexpectedly")),
        Err(e) => AgentError::Watch(format!("{task} panicked: {e}")),
    }
}

/// Watch Classifier objects. Every change queues the classifier for
/// evaluation and marks the watch set for rebuild; deletes queue too so the
/// scheduler removes the report.
async fn watch_classifiers(access: ClusterAccess, queue: Arc<JobQueue>, registry: Arc<WatchRegistry>) {
    let mut backoff = FibonacciBackoff::new(1, 30);
    loop {
        let stream = watcher::watcher(access.classifiers(), watcher::Config::default());
        futures::pin_mut!(stream);

        loop {
            match stream.try_next().await {
                Ok(Some(Event::Applied(classifier) | Event::Deleted(classifier))) => {
                    backoff.reset();
                    if let Some(name) = classifier.metadata.name.as_deref() {
                        debug!(classifier = %name, "classifier changed");
                        queue.push(name);
                        registry.mark_rebuild();
                    }
                }
                Ok(Some(Event::Restarted(classifiers))) => {
                    backoff.reset();
                    for classifier in &classifiers {
                        if let Some(name) = classifier.metadata.name.as_deref() {
                            queue.push(name);
                        }
                    }
                    registry.mark_rebuild();
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Classifier watch error; restarting");
                    break;
                }
            }
        }
        tokio::time::sleep(backoff.next_backoff()).await;
    }
}

/// Watch CustomResourceDefinitions. Installing a CRD for a parked kind
/// terminates the process: restarting is how the agent refreshes its API
/// discovery, and the orchestrator brings it back up.
async fn watch_custom_resource_definitions(access: ClusterAccess, registry: Arc<WatchRegistry>) {
    let mut backoff = FibonacciBackoff::new(1, 30);
    loop {
        let stream = watcher::watcher(
            access.custom_resource_definitions(),
            watcher::Config::default(),
        );
        futures::pin_mut!(stream);

        loop {
            match stream.try_next().await {
                Ok(Some(Event::Applied(crd))) => {
                    backoff.reset();
                    restart_for_pending(&registry, &crd);
                }
                Ok(Some(Event::Restarted(crds_installed))) => {
                    backoff.reset();
                    for crd in &crds_installed {
                        restart_for_pending(&registry, crd);
                    }
                }
                Ok(Some(Event::Deleted(_))) => {}
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "CustomResourceDefinition watch error; restarting");
                    break;
                }
            }
        }
        tokio::time::sleep(backoff.next_backoff()).await;
    }
}

fn restart_for_pending(registry: &WatchRegistry, crd: &CustomResourceDefinition) {
    let group = &crd.spec.group;
    let kind = &crd.spec.names.kind;
    for version in &crd.spec.versions {
        if !version.served {
            continue;
        }
        let gvk = GroupVersionKind::gvk(group, &version.name, kind);
        if registry.is_pending(&gvk) {
            info!(
                group = %group,
                version = %version.name,
                kind = %kind,
                "parked kind installed; restarting to refresh API discovery"
            );
            unsafe {
                libc::kill(libc::getpid(), libc::SIGTERM);
            }
            return;
        }
    }
}
