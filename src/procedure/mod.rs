//! Setup and recovery procedures for contributed nodes
//!
//! A procedure is one run of the setup or recovery state machine for a
//! single NodeContribution event. Each instance is a single control task
//! that owns all procedure state and receives typed completion signals over
//! a channel from detached worker tasks performing the blocking I/O (remote
//! dial, remote sessions, node watch). Procedures are launched detached from
//! the dispatcher: the handler returns immediately and the procedure runs to
//! its own completion.
//!
//! At most one procedure runs per object key: the launcher keys a registry
//! of in-flight instances and coalesces events that arrive while one is
//! running.

pub mod recovery;
pub mod setup;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::cluster::ClusterClient;
use crate::config::Settings;
use crate::crd::{ContributionState, NodeContribution, NodeContributionStatus};
use crate::dispatch::ObjectKey;
use crate::dns::{DnsRegistrar, RecordType};
use crate::notify::{template_for, ContributionNotice, Notifier};
use crate::remote::RemoteTransport;
use crate::token::JoinTokenIssuer;

pub use recovery::RecoveryProcedure;
pub use setup::SetupProcedure;

/// Global deadline spanning a whole procedure run
pub const PROCEDURE_TIMEOUT: Duration = Duration::from_secs(25 * 60);

/// Bound on one remote connection attempt (TCP connect + handshake)
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Settle window between recovery steps and between reconnect attempts
pub const SETTLE_DELAY: Duration = Duration::from_secs(3 * 60);

/// Post-reboot reconnect attempts before recovery gives up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Collaborators shared by every procedure instance
///
/// Injected at construction; procedures hold no global state.
pub struct ProcedureDeps {
    /// Cluster-side operations
    pub store: Arc<dyn ClusterClient>,
    /// Remote shell dialer
    pub transport: Arc<dyn RemoteTransport>,
    /// DNS registrar for node host records
    pub registrar: Arc<dyn DnsRegistrar>,
    /// Join token issuer
    pub tokens: Arc<dyn JoinTokenIssuer>,
    /// Notification sink
    pub notifier: Arc<dyn Notifier>,
    /// Operator settings
    pub settings: Settings,
}

/// Everything the setup procedure needs from the triggering event
pub struct SetupRequest {
    /// Object key of the contribution
    pub key: ObjectKey,
    /// Snapshot of the contribution at dispatch time
    pub contribution: Arc<NodeContribution>,
    /// Derived managed-node name
    pub node_name: String,
    /// Owning tenant
    pub tenant: String,
    /// Record type classified from the host field
    pub record_type: RecordType,
}

/// Everything the recovery procedure needs from the triggering event
pub struct RecoveryRequest {
    /// Object key of the contribution
    pub key: ObjectKey,
    /// Snapshot of the contribution at dispatch time
    pub contribution: Arc<NodeContribution>,
    /// Derived managed-node name
    pub node_name: String,
    /// Owning tenant
    pub tenant: String,
}

/// Launches procedures for the lifecycle handler
///
/// Returns false when the launch was coalesced because a procedure is
/// already running for the key.
#[cfg_attr(test, automock)]
pub trait ProcedureLauncher: Send + Sync {
    /// Launch a setup procedure for a node that does not exist yet
    fn launch_setup(&self, request: SetupRequest) -> bool;

    /// Launch a recovery procedure for an existing, unready node
    fn launch_recovery(&self, request: RecoveryRequest) -> bool;
}

/// Registry of in-flight procedure instances, keyed by object key
#[derive(Default)]
pub struct ProcedureRegistry {
    running: DashSet<ObjectKey>,
}

impl ProcedureRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a key for a new procedure; None when one is already running
    pub fn try_claim(self: &Arc<Self>, key: ObjectKey) -> Option<RegistryGuard> {
        if !self.running.insert(key.clone()) {
            return None;
        }
        Some(RegistryGuard {
            registry: self.clone(),
            key,
        })
    }

    /// Whether a procedure is currently running for the key
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.running.contains(key)
    }
}

/// Releases the registry claim when the procedure finishes
pub struct RegistryGuard {
    registry: Arc<ProcedureRegistry>,
    key: ObjectKey,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.running.remove(&self.key);
    }
}

/// Launcher that spawns procedures as detached tasks
pub struct TaskLauncher {
    deps: Arc<ProcedureDeps>,
    registry: Arc<ProcedureRegistry>,
}

impl TaskLauncher {
    /// Create a launcher over the shared collaborators
    pub fn new(deps: Arc<ProcedureDeps>) -> Self {
        Self {
            deps,
            registry: Arc::new(ProcedureRegistry::new()),
        }
    }

    /// Access the in-flight registry
    pub fn registry(&self) -> &Arc<ProcedureRegistry> {
        &self.registry
    }
}

impl ProcedureLauncher for TaskLauncher {
    fn launch_setup(&self, request: SetupRequest) -> bool {
        let Some(guard) = self.registry.try_claim(request.key.clone()) else {
            info!(key = %request.key, "procedure already running, coalescing setup event");
            return false;
        };
        let deps = self.deps.clone();
        tokio::spawn(async move {
            let _guard = guard;
            SetupProcedure::new(deps, request).run().await;
        });
        true
    }

    fn launch_recovery(&self, request: RecoveryRequest) -> bool {
        let Some(guard) = self.registry.try_claim(request.key.clone()) else {
            info!(key = %request.key, "procedure already running, coalescing recovery event");
            return false;
        };
        let deps = self.deps.clone();
        tokio::spawn(async move {
            let _guard = guard;
            RecoveryProcedure::new(deps, request).run().await;
        });
        true
    }
}

/// Status writer owned by a procedure's control task
///
/// The single writer of the contribution's status for the duration of the
/// run. Every write is awaited before the procedure advances, so an
/// external observer polling the object sees a monotonically advancing
/// history. Store write failures are logged, never silently dropped, and do
/// not stop the procedure.
pub(crate) struct StatusRecorder {
    store: Arc<dyn ClusterClient>,
    notifier: Arc<dyn Notifier>,
    namespace: String,
    name: String,
    tenant: Option<String>,
    host: String,
    status: NodeContributionStatus,
}

impl StatusRecorder {
    pub(crate) fn new(
        deps: &ProcedureDeps,
        key: &ObjectKey,
        contribution: &NodeContribution,
        tenant: Option<String>,
    ) -> Self {
        Self {
            store: deps.store.clone(),
            notifier: deps.notifier.clone(),
            namespace: key.namespace.clone().unwrap_or_default(),
            name: key.name.clone(),
            tenant,
            host: contribution.spec.host.clone(),
            status: NodeContributionStatus::default(),
        }
    }

    /// Set the state, append a message, and push the status to the store
    pub(crate) async fn record(&mut self, state: ContributionState, message: impl Into<String>) {
        self.status.state = state;
        self.status.messages.push(message.into());
        self.push().await;
    }

    /// Append a message without changing the state
    pub(crate) async fn append(&mut self, message: impl Into<String>) {
        self.status.messages.push(message.into());
        self.push().await;
    }

    /// Replace the message history with a single message and set the state
    pub(crate) async fn replace(&mut self, state: ContributionState, message: impl Into<String>) {
        self.status.messages.clear();
        self.record(state, message).await;
    }

    /// Send a notification reflecting the current state
    pub(crate) async fn notify(&self) {
        let notice = ContributionNotice {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            tenant: self.tenant.clone(),
            host: self.host.clone(),
            state: self.status.state,
            messages: self.status.messages.clone(),
        };
        self.notifier.send(template_for(self.status.state), &notice).await;
    }

    pub(crate) fn state(&self) -> ContributionState {
        self.status.state
    }

    async fn push(&self) {
        if let Err(e) = self
            .store
            .update_status(&self.namespace, &self.name, &self.status)
            .await
        {
            warn!(
                contribution = %format!("{}/{}", self.namespace, self.name),
                error = %e,
                "failed to update contribution status"
            );
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    /// Story: Only one procedure may run per object key
    ///
    /// Back-to-back update events for the same contribution must not race
    /// two procedures writing the same status.
    #[test]
    fn story_registry_claims_are_exclusive() {
        let registry = Arc::new(ProcedureRegistry::new());
        let key = ObjectKey::namespaced("tenant-acme", "edge-7");

        let guard = registry.try_claim(key.clone()).expect("first claim succeeds");
        assert!(registry.try_claim(key.clone()).is_none(), "second claim coalesces");
        assert!(registry.contains(&key));

        drop(guard);
        assert!(!registry.contains(&key), "claim released on drop");
        assert!(registry.try_claim(key).is_some(), "key claimable again");
    }

    /// Story: Claims for different keys do not interfere
    #[test]
    fn story_registry_claims_are_per_key() {
        let registry = Arc::new(ProcedureRegistry::new());
        let a = registry.try_claim(ObjectKey::namespaced("tenant-acme", "edge-7"));
        let b = registry.try_claim(ObjectKey::namespaced("tenant-acme", "edge-8"));
        assert!(a.is_some() && b.is_some());
    }
}
