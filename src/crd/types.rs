//! Supporting types for the NodeContribution CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a node contribution
///
/// The state advances as the setup or recovery procedure runs. `Incomplete`
/// is non-fatal: a procedure can still end in `Success` after recording it.
/// `Failure` is terminal for the procedure run that wrote it.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum ContributionState {
    /// Contribution has been accepted but no procedure has run yet
    #[default]
    Initial,
    /// Setup procedure is provisioning the machine
    InProgress,
    /// Recovery procedure is driving the node back to readiness
    Recover,
    /// A non-fatal step failed; the procedure is still running
    Incomplete,
    /// The node is joined, ready, and scheduled as requested
    Success,
    /// The procedure ended without a usable node
    Failure,
}

impl ContributionState {
    /// Returns true if this state ends a procedure run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl std::fmt::Display for ContributionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "Initial"),
            Self::InProgress => write!(f, "InProgress"),
            Self::Recover => write!(f, "Recover"),
            Self::Incomplete => write!(f, "Incomplete"),
            Self::Success => write!(f, "Success"),
            Self::Failure => write!(f, "Failure"),
        }
    }
}
