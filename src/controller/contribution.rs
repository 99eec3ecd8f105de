//! Node lifecycle handler
//!
//! On each create/update event for a NodeContribution, determines tenant
//! enablement, the target node name, and whether the managed node already
//! exists and is Ready, then routes to the setup or recovery procedure.
//! Host validation precedes everything: an unclassifiable host fails the
//! contribution before any procedure is launched.
//!
//! | Tenant enabled | Node exists | Ready    | Action                       |
//! |----------------|-------------|----------|------------------------------|
//! | false          | -           | -        | disable spec, Failure, notify|
//! | true           | no          | -        | launch setup                 |
//! | true           | yes         | not True | launch recovery              |
//! | true           | yes         | True     | Success, nothing launched    |

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::config::Settings;
use crate::crd::{ContributionState, NodeContribution, NodeContributionStatus};
use crate::dispatch::{Event, EventHandler, ObjectKey};
use crate::dns;
use crate::node::{node_name, ready_state};
use crate::notify::{template_for, ContributionNotice, Notifier};
use crate::procedure::{ProcedureLauncher, RecoveryRequest, SetupRequest};
use crate::Error;

pub(crate) const MSG_INVALID_HOST: &str = "Invalid host: expected an IP address or DNS name";
pub(crate) const MSG_TENANT_DISABLED: &str = "Tenant disabled";
pub(crate) const MSG_NO_TENANT: &str = "No owning tenant for namespace";
pub(crate) const MSG_NODE_READY: &str = "Node is up and ready";

/// Routes NodeContribution events to procedures
///
/// Holds its collaborators by injection; no global state. Procedure
/// launches go through the [`ProcedureLauncher`] so at most one procedure
/// runs per key.
pub struct LifecycleHandler {
    store: Arc<dyn ClusterClient>,
    launcher: Arc<dyn ProcedureLauncher>,
    notifier: Arc<dyn Notifier>,
    settings: Settings,
}

impl LifecycleHandler {
    /// Create a handler over the given collaborators
    pub fn new(
        store: Arc<dyn ClusterClient>,
        launcher: Arc<dyn ProcedureLauncher>,
        notifier: Arc<dyn Notifier>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            launcher,
            notifier,
            settings,
        }
    }

    async fn process(&self, key: ObjectKey, contribution: Arc<NodeContribution>) -> Result<(), Error> {
        let namespace = key.namespace.clone().unwrap_or_default();
        let spec = &contribution.spec;

        // Every pass starts from an empty message history
        let status = NodeContributionStatus::default();

        let Some(tenant) = self.store.namespace_tenant(&namespace).await? else {
            warn!(key = %key, "namespace has no tenant label");
            self.fail(&key, None, spec.host.clone(), status, MSG_NO_TENANT).await?;
            return Ok(());
        };

        // Host validation precedes every routing decision
        let Some(record_type) = dns::record_type(&spec.host) else {
            warn!(key = %key, host = %spec.host, "host failed validation");
            self.fail(&key, Some(tenant), spec.host.clone(), status, MSG_INVALID_HOST)
                .await?;
            return Ok(());
        };

        let enabled = tenant == self.settings.platform_tenant
            || self.store.tenant_enabled(&tenant).await?;
        if !enabled {
            info!(key = %key, tenant = %tenant, "tenant disabled, disabling contribution");
            // Spec-only update so the node stays cordoned if it ever joins
            self.store.disable_contribution(&namespace, &key.name).await?;
            self.fail(&key, Some(tenant), spec.host.clone(), status, MSG_TENANT_DISABLED)
                .await?;
            return Ok(());
        }

        let node_name = node_name(
            &key.name,
            &tenant,
            &self.settings.node_domain,
            &self.settings.platform_tenant,
        );

        match self.store.get_node(&node_name).await? {
            Some(node) => {
                // Toggling `enabled` on a joined node only patches
                // scheduling; it never re-provisions
                let unschedulable = node
                    .spec
                    .as_ref()
                    .and_then(|s| s.unschedulable)
                    .unwrap_or(false);
                if unschedulable != !spec.enabled {
                    if let Err(e) = self
                        .store
                        .set_node_scheduling(&node_name, !spec.enabled)
                        .await
                    {
                        warn!(node = %node_name, error = %e, "scheduling re-sync failed");
                    }
                }

                if ready_state(&node).is_ready() {
                    debug!(key = %key, node = %node_name, "node ready, nothing to do");
                    let status = status
                        .state(ContributionState::Success)
                        .message(MSG_NODE_READY);
                    self.store.update_status(&namespace, &key.name, &status).await?;
                } else {
                    info!(key = %key, node = %node_name, "node unready, launching recovery");
                    self.launcher.launch_recovery(RecoveryRequest {
                        key: key.clone(),
                        contribution,
                        node_name,
                        tenant,
                    });
                }
            }
            None => {
                info!(key = %key, node = %node_name, "node absent, launching setup");
                self.launcher.launch_setup(SetupRequest {
                    key: key.clone(),
                    contribution,
                    node_name,
                    tenant,
                    record_type,
                });
            }
        }
        Ok(())
    }

    /// Write a terminal failure status and notify
    async fn fail(
        &self,
        key: &ObjectKey,
        tenant: Option<String>,
        host: String,
        status: NodeContributionStatus,
        message: &str,
    ) -> Result<(), Error> {
        let namespace = key.namespace.clone().unwrap_or_default();
        let status = status.state(ContributionState::Failure).message(message);
        self.store.update_status(&namespace, &key.name, &status).await?;

        let notice = ContributionNotice {
            name: key.name.clone(),
            namespace,
            tenant,
            host,
            state: status.state,
            messages: status.messages.clone(),
        };
        self.notifier.send(template_for(status.state), &notice).await;
        Ok(())
    }
}

#[async_trait]
impl EventHandler<NodeContribution> for LifecycleHandler {
    async fn handle(
        &self,
        event: Event,
        object: Option<Arc<NodeContribution>>,
    ) -> Result<(), Error> {
        let Some(contribution) = object else {
            // Deletion is a logged no-op; the managed node is garbage
            // collected through its owner references
            debug!(key = %event.key, "contribution deleted");
            return Ok(());
        };
        debug!(key = %event.key, kind = ?event.kind, "processing contribution event");
        self.process(event.key, contribution).await
    }
}
