//! Notification sink interface
//!
//! Terminal procedure outcomes (and immediate node-patch degradations) are
//! pushed to an external notification sink. Delivery — templated email to
//! tenant administrators — is an external collaborator; the orchestrator
//! only selects the template and supplies the payload.

use async_trait::async_trait;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::crd::ContributionState;

/// Template for a contribution that ended in failure
pub const TEMPLATE_FAILURE: &str = "node-contribution-failure";
/// Template for a contribution whose node is up and ready
pub const TEMPLATE_SUCCESS: &str = "node-contribution-successful";
/// Template for a contribution that degraded but kept going
pub const TEMPLATE_INCOMPLETE: &str = "node-contribution-incomplete";

/// Payload handed to the notification sink
#[derive(Clone, Debug)]
pub struct ContributionNotice {
    /// Contribution name
    pub name: String,
    /// Namespace the contribution lives in
    pub namespace: String,
    /// Owning tenant, when resolved
    pub tenant: Option<String>,
    /// Remote host from the contribution spec
    pub host: String,
    /// State at the time of the notification
    pub state: ContributionState,
    /// Ordered diagnostic messages accumulated so far
    pub messages: Vec<String>,
}

/// Select the template matching a contribution state
pub fn template_for(state: ContributionState) -> &'static str {
    match state {
        ContributionState::Success => TEMPLATE_SUCCESS,
        ContributionState::Failure => TEMPLATE_FAILURE,
        _ => TEMPLATE_INCOMPLETE,
    }
}

/// External notification sink
///
/// Implementations resolve recipients (tenant administrators) themselves;
/// send failures are the sink's problem and never propagate into a
/// procedure.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification rendered from the named template
    async fn send(&self, template: &str, notice: &ContributionNotice);
}

/// Sink used when no delivery channel is configured: structured log only
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, template: &str, notice: &ContributionNotice) {
        info!(
            template = %template,
            contribution = %format!("{}/{}", notice.namespace, notice.name),
            host = %notice.host,
            state = %notice.state,
            messages = ?notice.messages,
            "contribution notification"
        );
    }
}
