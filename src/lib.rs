//! Trellis - Kubernetes operator for tenant-contributed edge nodes
//!
//! Trellis turns bare, remotely reachable machines that tenants contribute
//! into correctly joined, labeled, schedulable cluster workers, and drives
//! unready workers back to readiness. All provisioning happens over an
//! out-of-band remote shell while a custom-resource watch loop schedules the
//! work asynchronously.
//!
//! # Architecture
//!
//! - A generic reconciliation dispatcher watches NodeContribution objects and
//!   serializes handler invocations per object key
//! - The lifecycle handler inspects cluster state and routes each
//!   contribution to a setup or recovery procedure
//! - Procedures are long-running state machines: a single control task per
//!   instance receives typed completion signals from detached worker tasks
//!   that perform the blocking remote I/O
//!
//! # Modules
//!
//! - [`crd`] - NodeContribution Custom Resource Definition
//! - [`dispatch`] - Generic watch-queue-worker reconciliation dispatcher
//! - [`controller`] - Node lifecycle handler (setup/recovery routing)
//! - [`procedure`] - Setup and recovery state machines
//! - [`remote`] - Remote command assembly and shell execution
//! - [`cluster`] - Narrow client interface over the Kubernetes API
//! - [`dns`] - Host record classification and registrar interface
//! - [`node`] - Managed node naming and readiness helpers
//! - [`notify`] - Notification sink interface
//! - [`token`] - Cluster join token issuer
//! - [`config`] - Operator settings
//! - [`retry`] - Retry utilities with exponential backoff
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod dispatch;
pub mod dns;
pub mod error;
pub mod node;
pub mod notify;
pub mod procedure;
pub mod remote;
pub mod retry;
pub mod token;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// These constants define the default values used throughout Trellis.
// Centralizing them here ensures consistency across CLI defaults, procedure
// deadlines, and test fixtures.

/// Default DNS zone under which managed nodes are named
pub const DEFAULT_NODE_DOMAIN: &str = "trellis.dev";

/// Name of the tenant that operates the platform itself
///
/// Nodes contributed under this tenant are named without a tenant segment.
pub const DEFAULT_PLATFORM_TENANT: &str = "trellis";

/// Namespace label naming the tenant that owns the namespace
pub const TENANT_LABEL: &str = "trellis.dev/tenant";

/// Default remote shell port
pub const DEFAULT_REMOTE_PORT: u16 = 22;
