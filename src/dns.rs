//! Host record classification and the DNS registrar interface
//!
//! The `host` field of a contribution must be classifiable as a DNS
//! address-record type before any remote work starts: IP literals map to
//! A/AAAA records, hostnames to CNAME records, anything else is rejected.
//! Registration itself is performed by an external registrar behind the
//! [`DnsRegistrar`] trait; a naming conflict there never blocks
//! installation.

use std::net::IpAddr;

use async_trait::async_trait;
use tracing::info;

#[cfg(test)]
use mockall::automock;

/// DNS address-record type derived from a contribution's host field
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordType {
    /// IPv4 address record
    A,
    /// IPv6 address record
    Aaaa,
    /// Alias record for a DNS name
    Cname,
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::Aaaa => write!(f, "AAAA"),
            Self::Cname => write!(f, "CNAME"),
        }
    }
}

/// Classify a host string as a record type
///
/// Returns `None` when the host is neither an IP literal nor a valid
/// RFC-1123 hostname; such contributions fail validation before any
/// procedure is launched.
pub fn record_type(host: &str) -> Option<RecordType> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(match ip {
            IpAddr::V4(_) => RecordType::A,
            IpAddr::V6(_) => RecordType::Aaaa,
        });
    }
    if is_valid_hostname(host) {
        return Some(RecordType::Cname);
    }
    None
}

/// RFC-1123 hostname check: dot-separated labels of alphanumerics and
/// hyphens, no label starting or ending with a hyphen, at most 253 chars.
fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

/// Outcome of a host record registration attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// The record was created
    Registered,
    /// A record with this name or address already exists
    AlreadyExists,
    /// The provider rejected the registration
    Rejected(String),
}

/// External DNS registrar
///
/// Registers the derived node name under the platform's zone so the joined
/// worker is reachable by its cluster name. Failures here degrade the setup
/// procedure to Incomplete but never stop it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DnsRegistrar: Send + Sync {
    /// Register a host record mapping `name` (relative to the zone) to
    /// `address`
    async fn register_host(
        &self,
        name: &str,
        record: RecordType,
        address: &str,
    ) -> RegistrationOutcome;
}

/// Registrar used when no DNS provider is configured
///
/// Logs the record that would have been registered and reports success, so
/// clusters without a managed zone still provision nodes.
pub struct LogRegistrar;

#[async_trait]
impl DnsRegistrar for LogRegistrar {
    async fn register_host(
        &self,
        name: &str,
        record: RecordType,
        address: &str,
    ) -> RegistrationOutcome {
        info!(name = %name, record = %record, address = %address, "no registrar configured, skipping host record");
        RegistrationOutcome::Registered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Host Classification Stories
    // =========================================================================
    //
    // Host validation is the first gate in the lifecycle handler: an
    // unclassifiable host fails the contribution before any remote dial.

    /// Story: IPv4 literals register as A records
    #[test]
    fn story_ipv4_host_is_a_record() {
        assert_eq!(record_type("198.51.100.7"), Some(RecordType::A));
        assert_eq!(record_type("10.0.0.1"), Some(RecordType::A));
    }

    /// Story: IPv6 literals register as AAAA records
    #[test]
    fn story_ipv6_host_is_aaaa_record() {
        assert_eq!(record_type("2001:db8::7"), Some(RecordType::Aaaa));
        assert_eq!(record_type("::1"), Some(RecordType::Aaaa));
    }

    /// Story: DNS names register as CNAME records
    #[test]
    fn story_hostname_is_cname_record() {
        assert_eq!(
            record_type("edge-7.lab.example.org"),
            Some(RecordType::Cname)
        );
        assert_eq!(record_type("edge7"), Some(RecordType::Cname));
    }

    /// Story: Malformed hosts are rejected before any procedure launches
    ///
    /// Underscores, spaces, empty labels and leading hyphens are not valid
    /// in any address-record type.
    #[test]
    fn story_malformed_hosts_are_rejected() {
        assert_eq!(record_type("bad_host!"), None);
        assert_eq!(record_type(""), None);
        assert_eq!(record_type("has space"), None);
        assert_eq!(record_type("double..dot"), None);
        assert_eq!(record_type("-leading.example.org"), None);
        assert_eq!(record_type("trailing-.example.org"), None);
    }

    /// Story: Overlong names are rejected
    #[test]
    fn story_overlong_hostnames_are_rejected() {
        let label = "a".repeat(64);
        assert_eq!(record_type(&label), None);

        let name = format!("{}.example.org", "a".repeat(250));
        assert_eq!(record_type(&name), None);
    }

    /// Story: The fallback registrar reports success without side effects
    #[tokio::test]
    async fn story_log_registrar_always_succeeds() {
        let registrar = LogRegistrar;
        let outcome = registrar
            .register_host("edge-7.acme", RecordType::A, "198.51.100.7")
            .await;
        assert_eq!(outcome, RegistrationOutcome::Registered);
    }
}
