//! Managed node naming and readiness helpers
//!
//! Pure functions over the cluster-side view of a contributed machine: the
//! deterministic node name, the Ready condition, and the owner references
//! that tie a node back to its tenant.

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

/// Tri-state readiness of a managed node, plus the absent case
///
/// Mirrors the Kubernetes `Ready` condition: a node that has not reported
/// conditions yet has no Ready entry at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyState {
    /// Kubelet reports the node healthy and ready for pods
    True,
    /// Kubelet reports the node unhealthy
    False,
    /// The node controller lost contact with the kubelet
    Unknown,
    /// No Ready condition is present on the node
    Absent,
}

impl ReadyState {
    /// Returns true only for a positively ready node
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::True)
    }
}

/// Extract the Ready condition from a node object
pub fn ready_state(node: &Node) -> ReadyState {
    let conditions = node.status.as_ref().and_then(|s| s.conditions.as_ref());
    let Some(ready) = conditions.and_then(|conds| conds.iter().find(|c| c.type_ == "Ready")) else {
        return ReadyState::Absent;
    };
    match ready.status.as_str() {
        "True" => ReadyState::True,
        "False" => ReadyState::False,
        _ => ReadyState::Unknown,
    }
}

/// Derive the deterministic managed-node name for a contribution
///
/// `<contribution>.<tenant>.<domain>`, except that nodes owned by the
/// platform tenant drop the tenant segment: `<contribution>.<domain>`.
pub fn node_name(contribution: &str, tenant: &str, domain: &str, platform_tenant: &str) -> String {
    if tenant == platform_tenant {
        format!("{contribution}.{domain}")
    } else {
        format!("{contribution}.{tenant}.{domain}")
    }
}

/// The registrar-side record name: the node name relative to the zone
pub fn record_name(node_name: &str, domain: &str) -> String {
    node_name
        .strip_suffix(&format!(".{domain}"))
        .unwrap_or(node_name)
        .to_string()
}

/// Build an owner reference from raw object coordinates
pub fn owner_reference(api_version: &str, kind: &str, name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        ..Default::default()
    }
}
