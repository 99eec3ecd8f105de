//! NodeContribution Custom Resource Definition
//!
//! A NodeContribution is a tenant's request to enroll a remote machine as a
//! cluster worker. The spec carries the remote-access credentials and the
//! desired schedulability; the status records the lifecycle state written by
//! the setup and recovery procedures.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ContributionState;

/// Specification for a NodeContribution
///
/// Credentials are treated as immutable once the contribution is accepted;
/// only `enabled` is expected to change over the object's lifetime. Toggling
/// `enabled` on an already-joined node patches scheduling without
/// re-provisioning.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "NodeContribution",
    plural = "nodecontributions",
    shortname = "nc",
    status = "NodeContributionStatus",
    namespaced,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.host"}"#,
    printcolumn = r#"{"name":"Enabled","type":"boolean","jsonPath":".spec.enabled"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeContributionSpec {
    /// Remote machine address: an IP literal or a DNS name
    pub host: String,

    /// Remote shell port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Remote user with privilege escalation rights
    pub user: String,

    /// Password for the remote user
    pub password: String,

    /// Desired schedulability of the joined node
    ///
    /// The managed node's `unschedulable` flag is kept as the inverse of
    /// this field.
    pub enabled: bool,
}

fn default_port() -> u16 {
    crate::DEFAULT_REMOTE_PORT
}

impl NodeContributionSpec {
    /// Remote shell address in `host:port` form
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Status for a NodeContribution
///
/// `messages` is ordered and append-only within one reconciliation pass, and
/// reset to empty at the start of every pass before a new procedure begins.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeContributionStatus {
    /// Current lifecycle state
    #[serde(default)]
    pub state: ContributionState,

    /// Ordered diagnostic messages from the current procedure run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
}

impl NodeContributionStatus {
    /// Create a new status with the given state
    pub fn with_state(state: ContributionState) -> Self {
        Self {
            state,
            ..Default::default()
        }
    }

    /// Set the state and return self for chaining
    pub fn state(mut self, state: ContributionState) -> Self {
        self.state = state;
        self
    }

    /// Append a diagnostic message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.messages.push(msg.into());
        self
    }
}
