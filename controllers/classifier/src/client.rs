//! Kubernetes access layer.
//!
//! Thin adapter over `kube::Client`: typed Apis for the agent's own CRDs,
//! dynamic list/watch plumbing for arbitrary kinds named by classifier
//! rules, the cluster version lookup, and the management cluster client
//! built from the kubeconfig secret.

use k8s_openapi::api::core::v1::{Node, Secret};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::ListParams;
use kube::config::{Config, KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::{Api, Client};
use semver::Version;

use crate::error::AgentError;
use crate::evaluator;
use crds::{Classifier, ClassifierReport};

/// Shared handle on the cluster the agent runs in.
#[derive(Clone)]
pub struct ClusterAccess {
    client: Client,
}

impl ClusterAccess {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn classifiers(&self) -> Api<Classifier> {
        Api::all(self.client.clone())
    }

    /// Local reports, always in the report namespace.
    pub fn reports(&self) -> Api<ClassifierReport> {
        Api::namespaced(self.client.clone(), crds::REPORT_NAMESPACE)
    }

    pub fn custom_resource_definitions(&self) -> Api<CustomResourceDefinition> {
        Api::all(self.client.clone())
    }

    /// Look a kind up in API discovery. `None` means the kind is not
    /// installed, which is never an error here; the registry parks such
    /// kinds until their CRD appears.
    pub async fn find_api_resource(
        &self,
        gvk: &GroupVersionKind,
    ) -> Result<Option<(ApiResource, bool)>, AgentError> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    return Ok(Some((ar, namespaced)));
                }
            }
        }
        Ok(None)
    }

    /// Dynamic Api over one kind, namespace-scoped when asked for and the
    /// kind allows it.
    pub fn dynamic_api(
        &self,
        ar: &ApiResource,
        namespaced: bool,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, ar),
            _ => Api::all_with(self.client.clone(), ar),
        }
    }

    /// List all resources of one kind, cluster-wide or in one namespace.
    pub async fn list_resources(
        &self,
        ar: &ApiResource,
        namespaced: bool,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, AgentError> {
        let api = self.dynamic_api(ar, namespaced, namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    /// Kubernetes version of this cluster, as reported by any node's
    /// kubelet. An empty node list is a transient failure.
    pub async fn cluster_version(&self) -> Result<Version, AgentError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;
        let raw = list
            .items
            .into_iter()
            .find_map(|node| node.status.and_then(|s| s.node_info).map(|i| i.kubelet_version))
            .ok_or(AgentError::NoNodeAvailable)?;
        evaluator::parse_version(&raw)
    }

    /// Client for the management cluster, built from the kubeconfig stored
    /// in the well-known secret.
    pub async fn management_client(&self) -> Result<Client, AgentError> {
        let secrets: Api<Secret> =
            Api::namespaced(self.client.clone(), crds::AGENT_SECRET_NAMESPACE);
        let secret = secrets.get(crds::AGENT_SECRET_NAME).await?;

        let bytes = secret
            .data
            .as_ref()
            .and_then(|data| data.get(crds::AGENT_SECRET_KEY))
            .ok_or_else(|| {
                AgentError::Kubeconfig(format!(
                    "secret {}/{} has no {} key",
                    crds::AGENT_SECRET_NAMESPACE,
                    crds::AGENT_SECRET_NAME,
                    crds::AGENT_SECRET_KEY
                ))
            })?;
        let raw = std::str::from_utf8(&bytes.0)
            .map_err(|e| AgentError::Kubeconfig(format!("kubeconfig is not UTF-8: {e}")))?;

        let kubeconfig =
            Kubeconfig::from_yaml(raw).map_err(|e| AgentError::Kubeconfig(e.to_string()))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| AgentError::Kubeconfig(e.to_string()))?;
        Client::try_from(config).map_err(AgentError::Kube)
    }
}
