//! Custom Resource Definitions for Trellis
//!
//! This module contains the NodeContribution CRD through which tenants
//! submit machines for enrollment as cluster workers.

mod contribution;
mod types;

pub use contribution::{NodeContribution, NodeContributionSpec, NodeContributionStatus};
pub use types::ContributionState;
