//! Operator settings
//!
//! Settings come from CLI flags with environment fallbacks and are shared
//! across the handler and the procedures. Everything has a default so the
//! operator runs unconfigured in a standard deployment.

use std::time::Duration;

/// Shared operator configuration
#[derive(Clone, Debug)]
pub struct Settings {
    /// DNS zone under which managed nodes are named
    pub node_domain: String,
    /// Tenant operating the platform itself (its nodes drop the tenant
    /// segment from their names)
    pub platform_tenant: String,
    /// Kubernetes package version pinned during installation
    pub kubernetes_version: String,
    /// Validity of issued join tokens
    pub join_token_ttl: Duration,
    /// Number of dispatcher workers
    pub workers: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node_domain: crate::DEFAULT_NODE_DOMAIN.to_string(),
            platform_tenant: crate::DEFAULT_PLATFORM_TENANT.to_string(),
            kubernetes_version: "1.19.2".to_string(),
            join_token_ttl: Duration::from_secs(600),
            workers: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_coherent() {
        let settings = Settings::default();
        assert_eq!(settings.node_domain, "trellis.dev");
        assert_eq!(settings.platform_tenant, "trellis");
        assert_eq!(settings.join_token_ttl, Duration::from_secs(600));
        assert!(settings.workers >= 1);
    }
}
