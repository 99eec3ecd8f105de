//! Narrow client interface over the Kubernetes API
//!
//! Everything the lifecycle handler and the procedures need from the
//! cluster goes through [`ClusterClient`]: tenant enablement, managed-node
//! lookup and patching, contribution status writes, and the node readiness
//! watch. The trait keeps the orchestrator testable and the generated
//! clients for tenant objects out of scope (tenants are read as dynamic
//! objects).

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Node};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::runtime::watcher;
use kube::Client;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{NodeContribution, NodeContributionStatus};
use crate::node::{owner_reference, ready_state, ReadyState};
use crate::Error;

/// Field manager recorded on every write this operator makes
pub const FIELD_MANAGER: &str = "trellis-operator";

/// API group/version of the tenant objects
const TENANT_API_VERSION: &str = "trellis.dev/v1alpha1";

/// One observation from the managed-node readiness watch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeWatchEvent {
    /// The node object changed; carries its current Ready condition
    Changed(ReadyState),
    /// The node object was deleted
    Deleted,
}

/// Cluster-side operations used by the orchestrator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Tenant named by the namespace's tenant label, if any
    async fn namespace_tenant(&self, namespace: &str) -> Result<Option<String>, Error>;

    /// Whether the tenant exists and is enabled
    async fn tenant_enabled(&self, tenant: &str) -> Result<bool, Error>;

    /// Owner references linking a managed node back to its tenant and the
    /// tenant's namespace
    async fn owner_references(&self, tenant: &str) -> Result<Vec<OwnerReference>, Error>;

    /// Fetch the managed node by name
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// Set the node's unschedulable flag
    async fn set_node_scheduling(&self, name: &str, unschedulable: bool) -> Result<(), Error>;

    /// Replace the node's owner references
    async fn set_node_owner_references(
        &self,
        name: &str,
        references: Vec<OwnerReference>,
    ) -> Result<(), Error>;

    /// Watch one node for readiness changes and deletion
    async fn watch_node(&self, name: &str)
        -> Result<BoxStream<'static, NodeWatchEvent>, Error>;

    /// Spec-only update forcing `enabled: false` on a contribution
    async fn disable_contribution(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Write a contribution's status subresource
    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NodeContributionStatus,
    ) -> Result<(), Error>;
}

/// Production implementation over a kube client
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn tenant_api(&self) -> Api<DynamicObject> {
        let ar = ApiResource {
            group: "trellis.dev".to_string(),
            version: "v1alpha1".to_string(),
            api_version: TENANT_API_VERSION.to_string(),
            kind: "Tenant".to_string(),
            plural: "tenants".to_string(),
        };
        Api::all_with(self.client.clone(), &ar)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn namespace_tenant(&self, namespace: &str) -> Result<Option<String>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let Some(ns) = api.get_opt(namespace).await? else {
            return Ok(None);
        };
        Ok(ns
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(crate::TENANT_LABEL))
            .cloned())
    }

    async fn tenant_enabled(&self, tenant: &str) -> Result<bool, Error> {
        let Some(obj) = self.tenant_api().get_opt(tenant).await? else {
            debug!(tenant = %tenant, "tenant object not found, treating as disabled");
            return Ok(false);
        };
        Ok(obj
            .data
            .pointer("/spec/enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    async fn owner_references(&self, tenant: &str) -> Result<Vec<OwnerReference>, Error> {
        let mut references = Vec::new();

        if let Some(obj) = self.tenant_api().get_opt(tenant).await? {
            if let Some(uid) = obj.metadata.uid.as_deref() {
                references.push(owner_reference(TENANT_API_VERSION, "Tenant", tenant, uid));
            }
        }

        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespace_name = format!("tenant-{tenant}");
        if let Some(ns) = namespaces.get_opt(&namespace_name).await? {
            if let Some(uid) = ns.metadata.uid.as_deref() {
                references.push(owner_reference("v1", "Namespace", &namespace_name, uid));
            }
        }

        Ok(references)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn set_node_scheduling(&self, name: &str, unschedulable: bool) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "spec": { "unschedulable": unschedulable }
        });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        debug!(node = %name, unschedulable, "patched node scheduling");
        Ok(())
    }

    async fn set_node_owner_references(
        &self,
        name: &str,
        references: Vec<OwnerReference>,
    ) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": { "ownerReferences": references }
        });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        debug!(node = %name, "patched node owner references");
        Ok(())
    }

    async fn watch_node(
        &self,
        name: &str,
    ) -> Result<BoxStream<'static, NodeWatchEvent>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let name = name.to_string();

        let stream = watcher(api, config).filter_map(move |event| {
            let name = name.clone();
            async move {
                match event {
                    Ok(watcher::Event::Apply(node)) | Ok(watcher::Event::InitApply(node)) => {
                        Some(NodeWatchEvent::Changed(ready_state(&node)))
                    }
                    Ok(watcher::Event::Delete(_)) => Some(NodeWatchEvent::Deleted),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(node = %name, error = %e, "node watch error, stream will resume");
                        None
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn disable_contribution(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<NodeContribution> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "spec": { "enabled": false }
        });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &NodeContributionStatus,
    ) -> Result<(), Error> {
        let api: Api<NodeContribution> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        debug!(
            contribution = %format!("{namespace}/{name}"),
            state = %status.state,
            "updated contribution status"
        );
        Ok(())
    }
}
