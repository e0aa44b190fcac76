//! Watch registry.
//!
//! Keeps exactly one live watch per (group, version, kind) referenced by any
//! classifier's deployed-resource constraints, parks kinds the cluster does
//! not serve yet, and queues interested classifiers whenever a watched
//! resource changes.
//!
//! Lock discipline: the live/pending sets are only touched under the
//! registry mutex; the rebuild flag is an atomic used purely as a wake-up
//! hint. Watch callbacks never take the registry mutex - they read the
//! interests map (its own mutex) and push onto the job queue.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::TryStreamExt;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::FibonacciBackoff;
use crate::client::ClusterAccess;
use crate::error::AgentError;
use crate::queue::JobQueue;
use crds::Classifier;

/// Rebuild poll period; the atomic flag is only a wake-up hint.
const REBUILD_POLL: Duration = Duration::from_secs(1);

/// Stable map key for a (group, version, kind) triple.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

type Interests = BTreeMap<String, BTreeSet<String>>;

struct WatchEntry {
    task: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryState {
    /// Kinds with a running watch task
    live: HashMap<String, WatchEntry>,
    /// Referenced kinds the cluster's API discovery does not serve yet
    pending: BTreeSet<String>,
}

pub struct WatchRegistry {
    state: Mutex<RegistryState>,
    /// gvk key -> names of classifiers referencing it. Separate mutex so
    /// watch callbacks never contend with registry mutations.
    interests: Arc<Mutex<Interests>>,
    rebuild: AtomicBool,
    queue: Arc<JobQueue>,
}

impl WatchRegistry {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            interests: Arc::new(Mutex::new(Interests::new())),
            rebuild: AtomicBool::new(false),
            queue,
        }
    }

    /// Request a watch-set rebuild on the next worker wake-up. Safe to call
    /// from any task without holding a lock.
    pub fn mark_rebuild(&self) {
        self.rebuild.store(true, Ordering::SeqCst);
    }

    // A mark arriving while a rebuild is in flight stays set, so the worker
    // runs another pass.
    fn take_rebuild(&self) -> bool {
        self.rebuild.swap(false, Ordering::SeqCst)
    }

    /// Whether a kind is referenced by some classifier but not installed.
    pub fn is_pending(&self, gvk: &GroupVersionKind) -> bool {
        self.state.lock().unwrap().pending.contains(&gvk_key(gvk))
    }

    /// Rebuild worker. Wakes on a short interval and reconciles the watch
    /// set against the current classifiers whenever the flag is set.
    pub async fn run(
        self: Arc<Self>,
        access: ClusterAccess,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.take_rebuild() {
                if let Err(e) = self.rebuild_watches(&access).await {
                    warn!(error = %e, "watch-set rebuild failed; will retry");
                    self.mark_rebuild();
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(REBUILD_POLL) => {}
                _ = shutdown.changed() => {}
            }
        }

        let mut state = self.state.lock().unwrap();
        for (_, entry) in state.live.drain() {
            entry.task.abort();
        }
    }

    async fn rebuild_watches(&self, access: &ClusterAccess) -> Result<(), AgentError> {
        let classifiers = access.classifiers().list(&Default::default()).await?.items;
        let targets = target_kinds(&classifiers);
        debug!(kinds = targets.len(), "rebuilding watch set");

        *self.interests.lock().unwrap() = targets
            .iter()
            .map(|(key, (_, names))| (key.clone(), names.clone()))
            .collect();

        // Start watches for newly referenced kinds. Discovery runs outside
        // the registry mutex; only this worker mutates live/pending.
        for (key, (gvk, _)) in &targets {
            let already_live = self.state.lock().unwrap().live.contains_key(key);
            if already_live {
                continue;
            }
            match access.find_api_resource(gvk).await? {
                Some((ar, _)) => {
                    let task = self.spawn_watch(access, key.clone(), ar);
                    let mut state = self.state.lock().unwrap();
                    state.pending.remove(key);
                    state.live.insert(key.clone(), WatchEntry { task });
                    info!(gvk = %key, "watch started");
                }
                None => {
                    let mut state = self.state.lock().unwrap();
                    if state.pending.insert(key.clone()) {
                        info!(gvk = %key, "kind not installed; watch parked");
                    }
                }
            }
        }

        // Drop watches on kinds no classifier references anymore.
        let mut state = self.state.lock().unwrap();
        let stale: Vec<String> = state
            .live
            .keys()
            .filter(|key| !targets.contains_key(*key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(entry) = state.live.remove(&key) {
                entry.task.abort();
                info!(gvk = %key, "watch stopped");
            }
        }
        state.pending.retain(|key| targets.contains_key(key));

        Ok(())
    }

    fn spawn_watch(&self, access: &ClusterAccess, key: String, ar: ApiResource) -> JoinHandle<()> {
        let client = access.client();
        let queue = self.queue.clone();
        let interests = self.interests.clone();
        tokio::spawn(async move {
            watch_resource(client, ar, key, queue, interests).await;
        })
    }
}

/// Kinds referenced by at least one classifier, with the classifiers
/// interested in each.
fn target_kinds(classifiers: &[Classifier]) -> BTreeMap<String, (GroupVersionKind, BTreeSet<String>)> {
    let mut targets: BTreeMap<String, (GroupVersionKind, BTreeSet<String>)> = BTreeMap::new();
    for classifier in classifiers {
        let Some(name) = classifier.metadata.name.clone() else {
            continue;
        };
        for constraint in &classifier.spec.deployed_resource_constraints {
            let gvk = constraint.group_version_kind();
            targets
                .entry(gvk_key(&gvk))
                .or_insert_with(|| (gvk, BTreeSet::new()))
                .1
                .insert(name.clone());
        }
    }
    targets
}

/// Long-running watch on one kind, cluster-wide. Any observed change queues
/// every classifier referencing the kind; stream errors restart the watch
/// after a Fibonacci backoff.
async fn watch_resource(
    client: Client,
    ar: ApiResource,
    key: String,
    queue: Arc<JobQueue>,
    interests: Arc<Mutex<Interests>>,
) {
    let mut backoff = FibonacciBackoff::new(1, 30);
    loop {
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);

        loop {
            match stream.try_next().await {
                Ok(Some(Event::Applied(_) | Event::Deleted(_))) => {
                    backoff.reset();
                    notify(&key, &queue, &interests);
                }
                Ok(Some(Event::Restarted(objects))) => {
                    backoff.reset();
                    if !objects.is_empty() {
                        notify(&key, &queue, &interests);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(gvk = %key, error = %e, "watch stream error; restarting");
                    break;
                }
            }
        }
        tokio::time::sleep(backoff.next_backoff()).await;
    }
}

fn notify(key: &str, queue: &JobQueue, interests: &Mutex<Interests>) {
    let names: Vec<String> = interests
        .lock()
        .unwrap()
        .get(key)
        .map(|names| names.iter().cloned().collect())
        .unwrap_or_default();
    for name in names {
        debug!(gvk = %key, classifier = %name, "resource changed; queueing evaluation");
        queue.push(&name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{ClassifierSpec, DeployedResourceConstraint};
    use kube::core::ObjectMeta;

    fn classifier(name: &str, kinds: &[(&str, &str, &str)]) -> Classifier {
        Classifier {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: ClassifierSpec {
                classifier_labels: vec![],
                kubernetes_version_constraints: vec![],
                deployed_resource_constraints: kinds
                    .iter()
                    .map(|(group, version, kind)| DeployedResourceConstraint {
                        group: group.to_string(),
                        version: version.to_string(),
                        kind: kind.to_string(),
                        namespace: None,
                        min_count: None,
                        max_count: None,
                        label_filters: vec![],
                        field_filters: vec![],
                    })
                    .collect(),
            },
        }
    }

    #[test]
    fn gvk_key_omits_the_core_group() {
        assert_eq!(gvk_key(&GroupVersionKind::gvk("", "v1", "Pod")), "v1/Pod");
        assert_eq!(
            gvk_key(&GroupVersionKind::gvk("apps", "v1", "Deployment")),
            "apps/v1/Deployment"
        );
    }

    #[test]
    fn target_kinds_is_the_union_over_classifiers() {
        let classifiers = vec![
            classifier("a", &[("", "v1", "Pod"), ("apps", "v1", "Deployment")]),
            classifier("b", &[("", "v1", "Pod")]),
            classifier("c", &[]),
        ];

        let targets = target_kinds(&classifiers);
        assert_eq!(targets.len(), 2);

        let (_, pod_names) = &targets["v1/Pod"];
        assert_eq!(
            pod_names.iter().cloned().collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        let (_, deploy_names) = &targets["apps/v1/Deployment"];
        assert_eq!(deploy_names.iter().cloned().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn target_kinds_dedups_within_one_classifier() {
        let classifiers = vec![classifier("a", &[("", "v1", "Pod"), ("", "v1", "Pod")])];

        let targets = target_kinds(&classifiers);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets["v1/Pod"].1.len(), 1);
    }

    #[test]
    fn mark_rebuild_survives_until_taken() {
        let registry = WatchRegistry::new(Arc::new(JobQueue::default()));

        assert!(!registry.take_rebuild());
        registry.mark_rebuild();
        registry.mark_rebuild();
        assert!(registry.take_rebuild());
        assert!(!registry.take_rebuild());
    }

    #[test]
    fn notify_queues_only_interested_classifiers() {
        let queue = Arc::new(JobQueue::default());
        let interests: Arc<Mutex<Interests>> = Arc::new(Mutex::new(Interests::new()));
        interests.lock().unwrap().insert(
            "v1/Pod".to_string(),
            ["a".to_string(), "b".to_string()].into_iter().collect(),
        );

        notify("v1/Pod", &queue, &interests);
        notify("v1/Service", &queue, &interests);

        assert_eq!(queue.drain(), vec!["a", "b"]);
    }
}
