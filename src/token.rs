//! Cluster join token issuer
//!
//! Every installation embeds a freshly issued, short-lived join command.
//! The issuer is an external collaborator; the production implementation
//! shells out to `kubeadm` on the head node.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// Issues short-lived cluster join commands
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JoinTokenIssuer: Send + Sync {
    /// Create a join token valid for `ttl` and return the full join command
    /// to run on the machine named `hostname`
    async fn create_join_token(&self, ttl: Duration, hostname: &str) -> Result<String, Error>;
}

/// Issuer that invokes `kubeadm token create` on the head node
pub struct KubeadmTokenIssuer;

#[async_trait]
impl JoinTokenIssuer for KubeadmTokenIssuer {
    async fn create_join_token(&self, ttl: Duration, hostname: &str) -> Result<String, Error> {
        let ttl_arg = format!("{}s", ttl.as_secs());
        retry_with_backoff(
            &RetryConfig::with_max_attempts(3),
            "kubeadm_token_create",
            || async {
                let output = Command::new("kubeadm")
                    .args([
                        "token",
                        "create",
                        "--ttl",
                        &ttl_arg,
                        "--description",
                        hostname,
                        "--print-join-command",
                    ])
                    .output()
                    .await
                    .map_err(|e| Error::token(format!("failed to run kubeadm: {e}")))?;

                if !output.status.success() {
                    return Err(Error::token(format!(
                        "kubeadm token create exited with {}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }

                let command = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if command.is_empty() {
                    return Err(Error::token("kubeadm printed an empty join command"));
                }
                debug!(hostname = %hostname, "issued join token");
                Ok(command)
            },
        )
        .await
    }
}
