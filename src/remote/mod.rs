//! Remote command execution over an out-of-band shell transport
//!
//! The transport is the only path to a contributed machine before it joins
//! the cluster. [`RemoteTransport`] dials a host under a bounded timeout and
//! yields a [`RemoteConnection`]; connections run single probe commands or
//! pipe whole command sequences through one interactive shell session.
//! Production uses the ssh2-backed implementation in [`ssh`]; procedures
//! only ever see the traits.

pub mod commands;
pub mod ssh;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

pub use commands::{detect_os, install_commands, reconfigure_commands, uninstall_commands, OsFamily};

/// Errors surfaced by the remote command library
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RemoteError {
    /// The host could not be resolved to a dialable address
    #[error("address resolution failed: {0}")]
    Resolve(String),

    /// TCP connect or protocol handshake failed
    #[error("handshake failed: {0}")]
    Dial(String),

    /// The remote host rejected the credentials
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Opening or driving a session failed
    #[error("session error: {0}")]
    Session(String),

    /// Writing the command stream failed or the shell exited abnormally
    #[error("command stream error: {0}")]
    CommandStream(String),

    /// The probed operating system is not a supported family
    #[error("unsupported operating system")]
    UnknownOs,
}

/// Credentials for dialing a contributed machine
#[derive(Clone)]
pub struct Credentials {
    /// Remote user with privilege escalation rights
    pub user: String,
    /// Password for the remote user
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never let the password reach logs
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Dialer for remote machines
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Open a connection to `host:port`, bounded by `timeout`
    async fn dial(
        &self,
        host: &str,
        port: u16,
        credentials: &Credentials,
        timeout: std::time::Duration,
    ) -> Result<Box<dyn RemoteConnection>, RemoteError>;
}

/// An established connection to a remote machine
///
/// Each method opens its own session on the connection, mirroring the
/// transport's session-per-operation model. Dropping the connection closes
/// it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteConnection: Send {
    /// Run a single command and capture its output
    async fn exec_output(&mut self, command: &str) -> Result<Vec<u8>, RemoteError>;

    /// Run a single command, failing on non-zero exit
    async fn exec(&mut self, command: &str) -> Result<(), RemoteError>;

    /// Pipe commands into one interactive shell session in order
    ///
    /// Writes each command to the shell's input stream, surfaces the first
    /// stream error, and always waits for session completion before
    /// returning. Individual command failures mid-stream do not abort the
    /// shell; only a broken stream or an abnormal shell exit is an error.
    async fn run_sequential(&mut self, commands: &[String]) -> Result<(), RemoteError>;
}

impl std::fmt::Debug for dyn RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RemoteConnection")
    }
}

/// Probe the remote operating system
///
/// Reads `/etc/os-release` over the connection. An unrecognized OS is a
/// hard error: no command template exists for it.
pub async fn probe_os(conn: &mut dyn RemoteConnection) -> Result<OsFamily, RemoteError> {
    let output = conn.exec_output("cat /etc/os-release").await?;
    detect_os(&output).ok_or(RemoteError::UnknownOs)
}

/// Uninstall everything and perform a clean installation ending in a
/// cluster join
///
/// Probes the OS, then runs the uninstall and install sequences under
/// elevated privileges in a single interactive session. Used identically by
/// setup (first install) and recovery (reinstall with a fresh token).
pub async fn clean_installation(
    conn: &mut dyn RemoteConnection,
    hostname: &str,
    kubernetes_version: &str,
    join_command: &str,
) -> Result<(), RemoteError> {
    let os = probe_os(conn).await?;
    debug!(os = ?os, hostname = %hostname, "starting clean installation");

    let mut sequence = vec![commands::ELEVATE_COMMAND.to_string()];
    sequence.extend(uninstall_commands(os));
    sequence.extend(install_commands(os, hostname, kubernetes_version, join_command));
    conn.run_sequential(&sequence).await
}

/// Stop the runtime and node agent, flush firewall rules, and restart both
///
/// Recovery runs this before rebooting. The command template depends on the
/// probed OS family.
pub async fn reconfigure(
    conn: &mut dyn RemoteConnection,
    hostname: &str,
) -> Result<(), RemoteError> {
    let os = probe_os(conn).await?;
    debug!(os = ?os, hostname = %hostname, "reconfiguring node");

    let mut sequence = vec![commands::ELEVATE_COMMAND.to_string()];
    sequence.extend(reconfigure_commands(os, hostname));
    conn.run_sequential(&sequence).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    const UBUNTU_RELEASE: &[u8] = b"NAME=\"Ubuntu\"\nID=ubuntu\n";

    // =========================================================================
    // Clean Installation Stories
    // =========================================================================

    /// Story: Clean installation elevates, uninstalls, then installs
    ///
    /// The whole sequence runs in one shell session so the elevation at the
    /// top applies to everything after it.
    #[tokio::test]
    async fn story_clean_installation_orders_elevate_uninstall_install() {
        let mut conn = MockRemoteConnection::new();
        conn.expect_exec_output()
            .with(eq("cat /etc/os-release"))
            .times(1)
            .returning(|_| Ok(UBUNTU_RELEASE.to_vec()));
        conn.expect_run_sequential()
            .withf(|commands: &[String]| {
                let elevate = commands.iter().position(|c| c == "sudo su").unwrap();
                let reset = commands.iter().position(|c| c == "kubeadm reset -f").unwrap();
                let join = commands
                    .iter()
                    .position(|c| c.starts_with("kubeadm join"))
                    .unwrap();
                elevate == 0 && elevate < reset && reset < join
            })
            .times(1)
            .returning(|_| Ok(()));

        clean_installation(
            &mut conn,
            "edge-7.acme.trellis.dev",
            "1.19.2",
            "kubeadm join 192.0.2.1:6443 --token abcdef.0123456789abcdef",
        )
        .await
        .unwrap();
    }

    /// Story: An unrecognized OS aborts before any command runs
    #[tokio::test]
    async fn story_unknown_os_is_a_hard_error() {
        let mut conn = MockRemoteConnection::new();
        conn.expect_exec_output()
            .returning(|_| Ok(b"ID=alpine\n".to_vec()));
        conn.expect_run_sequential().times(0);

        let err = clean_installation(&mut conn, "n", "1.19.2", "join").await.unwrap_err();
        assert!(matches!(err, RemoteError::UnknownOs));
    }

    /// Story: A failed probe surfaces as the probe's error
    #[tokio::test]
    async fn story_probe_failure_propagates() {
        let mut conn = MockRemoteConnection::new();
        conn.expect_exec_output()
            .returning(|_| Err(RemoteError::Session("channel refused".to_string())));

        let err = probe_os(&mut conn).await.unwrap_err();
        assert!(matches!(err, RemoteError::Session(_)));
    }

    /// Story: Reconfiguration pipes the bounce sequence under elevation
    #[tokio::test]
    async fn story_reconfigure_elevates_and_bounces() {
        let mut conn = MockRemoteConnection::new();
        conn.expect_exec_output()
            .returning(|_| Ok(UBUNTU_RELEASE.to_vec()));
        conn.expect_run_sequential()
            .withf(|commands: &[String]| {
                commands[0] == "sudo su"
                    && commands.contains(&"systemctl stop kubelet".to_string())
                    && commands.contains(&"systemctl start kubelet".to_string())
            })
            .times(1)
            .returning(|_| Ok(()));

        reconfigure(&mut conn, "edge-7.acme.trellis.dev").await.unwrap();
    }

    /// Story: Credentials never leak the password through Debug
    #[test]
    fn story_credentials_debug_redacts_password() {
        let creds = Credentials {
            user: "ops".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("ops"));
        assert!(!rendered.contains("hunter2"));
    }
}
