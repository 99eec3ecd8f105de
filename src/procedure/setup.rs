//! Setup procedure: provision a never-before-seen contribution
//!
//! Drives a contribution from DNS registration through remote installation
//! to node patching and ownership assignment:
//!
//! ```text
//! DnsConfig -> Install -> NodePatch -> Success | Incomplete
//! ```
//!
//! `Failure` and the 25-minute timeout are reachable from any state; the
//! end of the procedure always sends a notification summarizing the
//! outcome. The DNS step never blocks installation: a naming conflict
//! degrades the run to `Incomplete` and the procedure proceeds.
//!
//! The control task owns all state; the remote dial and the installation
//! session run in detached worker tasks that post [`SetupSignal`]s back.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crd::ContributionState;
use crate::dns::RegistrationOutcome;
use crate::node::record_name;
use crate::remote::{clean_installation, Credentials, RemoteConnection, RemoteError};

use super::{ProcedureDeps, SetupRequest, StatusRecorder, DIAL_TIMEOUT, PROCEDURE_TIMEOUT};

pub(crate) const MSG_STARTED: &str = "Installation procedure has started";
pub(crate) const MSG_HANDSHAKE_FAILED: &str = "SSH handshake failed";
pub(crate) const MSG_INSTALL_FAILED: &str = "Node installation failed";
pub(crate) const MSG_SCHEDULING_FAILED: &str = "Scheduling configuration failed";
pub(crate) const MSG_OWNER_REF_FAILED: &str = "Setting owner reference failed";
pub(crate) const MSG_SUCCESSFUL: &str = "Node installation successful";
pub(crate) const MSG_TIMEOUT: &str = "Node installation failed: timeout";

/// Completion signals posted by setup worker tasks
enum SetupSignal {
    /// Remote dial finished
    Dialed(Result<Box<dyn RemoteConnection>, RemoteError>),
    /// Clean installation finished; the connection is closed either way
    Installed(Result<(), RemoteError>),
}

/// One run of the setup state machine
pub struct SetupProcedure {
    deps: Arc<ProcedureDeps>,
    request: SetupRequest,
    recorder: StatusRecorder,
}

impl SetupProcedure {
    /// Build a procedure instance for the given request
    pub fn new(deps: Arc<ProcedureDeps>, request: SetupRequest) -> Self {
        let recorder = StatusRecorder::new(
            &deps,
            &request.key,
            &request.contribution,
            Some(request.tenant.clone()),
        );
        Self {
            deps,
            request,
            recorder,
        }
    }

    /// Run the procedure to completion
    pub async fn run(mut self) {
        info!(
            key = %self.request.key,
            node = %self.request.node_name,
            "setup procedure started"
        );
        self.recorder
            .record(ContributionState::InProgress, MSG_STARTED)
            .await;

        let (tx, mut rx) = mpsc::channel::<SetupSignal>(8);

        self.configure_dns().await;
        self.spawn_dial(&tx);

        let deadline = tokio::time::sleep(PROCEDURE_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(key = %self.request.key, "setup procedure timed out");
                    self.recorder
                        .record(ContributionState::Failure, MSG_TIMEOUT)
                        .await;
                    break;
                }
                signal = rx.recv() => {
                    let Some(signal) = signal else { break };
                    match signal {
                        SetupSignal::Dialed(Err(e)) => {
                            warn!(key = %self.request.key, error = %e, "remote dial failed");
                            self.recorder
                                .record(ContributionState::Failure, MSG_HANDSHAKE_FAILED)
                                .await;
                            break;
                        }
                        SetupSignal::Dialed(Ok(conn)) => {
                            if !self.start_installation(conn, &tx).await {
                                break;
                            }
                        }
                        SetupSignal::Installed(Err(e)) => {
                            warn!(key = %self.request.key, error = %e, "installation failed");
                            self.recorder
                                .record(ContributionState::Failure, MSG_INSTALL_FAILED)
                                .await;
                            break;
                        }
                        SetupSignal::Installed(Ok(())) => {
                            if self.confirm_node().await {
                                self.patch_node().await;
                                break;
                            }
                            // Node not visible yet; stay in place until the
                            // watch re-triggers or the deadline fires.
                        }
                    }
                }
            }
        }

        // EndProcedure: one notification summarizing the outcome
        self.recorder.notify().await;
        info!(
            key = %self.request.key,
            state = %self.recorder.state(),
            "setup procedure finished"
        );
    }

    /// DNSConfig state: register the node's host record
    ///
    /// Non-fatal on every path; a conflict or rejection is recorded as
    /// Incomplete and the procedure advances to Install regardless.
    async fn configure_dns(&mut self) {
        let name = record_name(&self.request.node_name, &self.deps.settings.node_domain);
        let host = self.request.contribution.spec.host.clone();
        let outcome = self
            .deps
            .registrar
            .register_host(&name, self.request.record_type, &host)
            .await;
        match outcome {
            RegistrationOutcome::Registered => {
                debug!(record = %name, "host record registered");
            }
            RegistrationOutcome::AlreadyExists => {
                self.recorder
                    .record(
                        ContributionState::Incomplete,
                        format!("Hostname {name} or address {host} already exists"),
                    )
                    .await;
            }
            RegistrationOutcome::Rejected(reason) => {
                self.recorder
                    .record(
                        ContributionState::Incomplete,
                        format!("Hostname {name} or address {host} couldn't be added: {reason}"),
                    )
                    .await;
            }
        }
    }

    /// Install state, first half: dial the remote host in a worker task
    fn spawn_dial(&self, tx: &mpsc::Sender<SetupSignal>) {
        let transport = self.deps.transport.clone();
        let spec = self.request.contribution.spec.clone();
        let credentials = Credentials {
            user: spec.user.clone(),
            password: spec.password.clone(),
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = transport
                .dial(&spec.host, spec.port, &credentials, DIAL_TIMEOUT)
                .await;
            let _ = tx.send(SetupSignal::Dialed(result)).await;
        });
    }

    /// Install state, second half: issue a join token and run the clean
    /// installation in a worker task
    ///
    /// Returns false when the procedure must end (token issuance failed).
    async fn start_installation(
        &mut self,
        mut conn: Box<dyn RemoteConnection>,
        tx: &mpsc::Sender<SetupSignal>,
    ) -> bool {
        let join_command = match self
            .deps
            .tokens
            .create_join_token(self.deps.settings.join_token_ttl, &self.request.node_name)
            .await
        {
            Ok(command) => command,
            Err(e) => {
                warn!(key = %self.request.key, error = %e, "join token issuance failed");
                self.recorder
                    .record(ContributionState::Failure, MSG_INSTALL_FAILED)
                    .await;
                return false;
            }
        };

        let node_name = self.request.node_name.clone();
        let version = self.deps.settings.kubernetes_version.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result =
                clean_installation(conn.as_mut(), &node_name, &version, &join_command).await;
            // conn drops here, closing the remote connection
            let _ = tx.send(SetupSignal::Installed(result)).await;
        });
        true
    }

    /// Confirm the managed node now exists in the API
    async fn confirm_node(&self) -> bool {
        match self.deps.store.get_node(&self.request.node_name).await {
            Ok(Some(_)) => true,
            Ok(None) => {
                warn!(
                    node = %self.request.node_name,
                    "node object not present after installation"
                );
                false
            }
            Err(e) => {
                warn!(
                    node = %self.request.node_name,
                    error = %e,
                    "node lookup failed after installation"
                );
                false
            }
        }
    }

    /// NodePatch state: align scheduling with the spec and assign ownership
    ///
    /// Sub-step failures degrade the run to Incomplete and notify
    /// immediately, but the patch phase is still considered complete; when
    /// both sub-steps succeed the run ends in Success.
    async fn patch_node(&mut self) {
        let node_name = &self.request.node_name;
        let enabled = self.request.contribution.spec.enabled;
        let mut patched = true;

        if let Err(e) = self
            .deps
            .store
            .set_node_scheduling(node_name, !enabled)
            .await
        {
            warn!(node = %node_name, error = %e, "scheduling patch failed");
            self.recorder
                .record(ContributionState::Incomplete, MSG_SCHEDULING_FAILED)
                .await;
            self.recorder.notify().await;
            patched = false;
        }

        let references = match self.deps.store.owner_references(&self.request.tenant).await {
            Ok(references) => references,
            Err(e) => {
                warn!(tenant = %self.request.tenant, error = %e, "owner reference lookup failed");
                Vec::new()
            }
        };
        if let Err(e) = self
            .deps
            .store
            .set_node_owner_references(node_name, references)
            .await
        {
            warn!(node = %node_name, error = %e, "owner reference patch failed");
            self.recorder
                .record(ContributionState::Incomplete, MSG_OWNER_REF_FAILED)
                .await;
            self.recorder.notify().await;
            patched = false;
        }

        if patched {
            self.recorder
                .record(ContributionState::Success, MSG_SUCCESSFUL)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::dns::RegistrationOutcome;
    use crate::notify::{TEMPLATE_FAILURE, TEMPLATE_INCOMPLETE, TEMPLATE_SUCCESS};
    use k8s_openapi::api::core::v1::Node;

    fn joined_node() -> Node {
        Node::default()
    }

    // =========================================================================
    // Happy Path Stories
    // =========================================================================

    /// Story: A fresh contribution walks DnsConfig -> Install -> NodePatch
    /// -> Success
    ///
    /// DNS registers, the dial succeeds, the installation session runs, the
    /// node appears, scheduling and ownership are patched, and the final
    /// state is Success with a single success notification at the end.
    #[tokio::test(start_paused = true)]
    async fn story_full_setup_reaches_success() {
        let f = fixture(
            RecordingStore::with_node(joined_node()),
            ScriptedTransport::new(vec![DialScript::Connect(ConnScript::default())]),
            RegistrationOutcome::Registered,
        );

        SetupProcedure::new(f.deps.clone(), setup_request(true)).run().await;

        let states = f.store.states();
        assert_eq!(
            states,
            vec![ContributionState::InProgress, ContributionState::Success],
            "status history must advance InProgress -> Success"
        );
        assert_eq!(
            f.store.last_status().messages,
            vec![MSG_STARTED.to_string(), MSG_SUCCESSFUL.to_string()]
        );

        // Scheduling mirrors the spec: enabled -> schedulable
        assert_eq!(
            f.store.scheduling_calls.lock().unwrap().as_slice(),
            &[("edge-7.acme.trellis.dev".to_string(), false)]
        );
        // Ownership assigned from the tenant
        assert_eq!(
            f.store.owner_ref_calls.lock().unwrap().as_slice(),
            &[("edge-7.acme.trellis.dev".to_string(), 1)]
        );
        assert_eq!(f.notifier.templates(), vec![TEMPLATE_SUCCESS.to_string()]);
        assert_eq!(f.transport.dial_count(), 1);
    }

    /// Story: A disabled contribution is joined but left unschedulable
    #[tokio::test(start_paused = true)]
    async fn story_disabled_contribution_joins_unschedulable() {
        let f = fixture(
            RecordingStore::with_node(joined_node()),
            ScriptedTransport::new(vec![DialScript::Connect(ConnScript::default())]),
            RegistrationOutcome::Registered,
        );

        SetupProcedure::new(f.deps.clone(), setup_request(false)).run().await;

        assert_eq!(
            f.store.scheduling_calls.lock().unwrap().as_slice(),
            &[("edge-7.acme.trellis.dev".to_string(), true)],
            "disabled contribution must cordon the node"
        );
        assert_eq!(f.store.last_status().state, ContributionState::Success);
    }

    // =========================================================================
    // Degradation Stories
    // =========================================================================

    /// Story: A DNS name collision degrades the run but never blocks it
    ///
    /// The conflict is recorded as Incomplete, installation proceeds, and
    /// the run still ends in Success with the conflict retained in the
    /// message history.
    #[tokio::test(start_paused = true)]
    async fn story_dns_conflict_degrades_but_proceeds() {
        let f = fixture(
            RecordingStore::with_node(joined_node()),
            ScriptedTransport::new(vec![DialScript::Connect(ConnScript::default())]),
            RegistrationOutcome::AlreadyExists,
        );

        SetupProcedure::new(f.deps.clone(), setup_request(true)).run().await;

        let states = f.store.states();
        assert!(states.contains(&ContributionState::Incomplete));
        assert_eq!(*states.last().unwrap(), ContributionState::Success);

        let messages = f.store.last_status().messages;
        assert!(messages.iter().any(|m| m.contains("already exists")));
        assert!(messages.contains(&MSG_SUCCESSFUL.to_string()));
        assert_eq!(f.transport.dial_count(), 1, "install still ran");
    }

    /// Story: A node-patch sub-step failure notifies immediately
    ///
    /// Scheduling fails: the run ends Incomplete, with one immediate
    /// notification from the patch step and one final notification from
    /// EndProcedure.
    #[tokio::test(start_paused = true)]
    async fn story_patch_failure_is_incomplete_and_notifies_immediately() {
        let store = RecordingStore {
            node: std::sync::Mutex::new(Some(joined_node())),
            fail_scheduling: true,
            ..Default::default()
        };
        let f = fixture(
            store,
            ScriptedTransport::new(vec![DialScript::Connect(ConnScript::default())]),
            RegistrationOutcome::Registered,
        );

        SetupProcedure::new(f.deps.clone(), setup_request(true)).run().await;

        let last = f.store.last_status();
        assert_eq!(last.state, ContributionState::Incomplete);
        assert!(last.messages.contains(&MSG_SCHEDULING_FAILED.to_string()));
        assert_eq!(
            f.notifier.templates(),
            vec![TEMPLATE_INCOMPLETE.to_string(), TEMPLATE_INCOMPLETE.to_string()],
            "immediate notification plus the end-of-procedure one"
        );
    }

    // =========================================================================
    // Failure Stories
    // =========================================================================

    /// Story: A failed dial is terminal
    ///
    /// No installation is attempted and the failure notification goes out.
    #[tokio::test(start_paused = true)]
    async fn story_dial_failure_is_terminal() {
        let f = fixture(
            RecordingStore::default(),
            ScriptedTransport::new(vec![DialScript::Refuse]),
            RegistrationOutcome::Registered,
        );

        SetupProcedure::new(f.deps.clone(), setup_request(true)).run().await;

        let last = f.store.last_status();
        assert_eq!(last.state, ContributionState::Failure);
        assert!(last.messages.contains(&MSG_HANDSHAKE_FAILED.to_string()));
        assert_eq!(f.notifier.templates(), vec![TEMPLATE_FAILURE.to_string()]);
        assert!(
            f.store.scheduling_calls.lock().unwrap().is_empty(),
            "no patching after a failed dial"
        );
    }

    /// Story: A broken installation session is terminal
    #[tokio::test(start_paused = true)]
    async fn story_install_failure_is_terminal() {
        let f = fixture(
            RecordingStore::with_node(joined_node()),
            ScriptedTransport::new(vec![DialScript::Connect(ConnScript {
                run_sequential_ok: false,
                ..Default::default()
            })]),
            RegistrationOutcome::Registered,
        );

        SetupProcedure::new(f.deps.clone(), setup_request(true)).run().await;

        let last = f.store.last_status();
        assert_eq!(last.state, ContributionState::Failure);
        assert!(last.messages.contains(&MSG_INSTALL_FAILED.to_string()));
        assert!(f.store.scheduling_calls.lock().unwrap().is_empty());
    }

    /// Story: An unknown remote OS fails the installation
    #[tokio::test(start_paused = true)]
    async fn story_unknown_os_fails_installation() {
        let f = fixture(
            RecordingStore::with_node(joined_node()),
            ScriptedTransport::new(vec![DialScript::Connect(ConnScript {
                os_release: b"ID=alpine\n".to_vec(),
                ..Default::default()
            })]),
            RegistrationOutcome::Registered,
        );

        SetupProcedure::new(f.deps.clone(), setup_request(true)).run().await;

        let last = f.store.last_status();
        assert_eq!(last.state, ContributionState::Failure);
        assert!(last.messages.contains(&MSG_INSTALL_FAILED.to_string()));
    }

    /// Story: A hung dial hits the 25-minute deadline, not sooner
    ///
    /// Remote operations that never return must end in a timeout failure
    /// within the global deadline.
    #[tokio::test(start_paused = true)]
    async fn story_hung_remote_times_out() {
        let f = fixture(
            RecordingStore::default(),
            ScriptedTransport::new(vec![DialScript::Hang]),
            RegistrationOutcome::Registered,
        );

        let started = tokio::time::Instant::now();
        SetupProcedure::new(f.deps.clone(), setup_request(true)).run().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= PROCEDURE_TIMEOUT, "must not fail early");
        assert!(
            elapsed < PROCEDURE_TIMEOUT + std::time::Duration::from_secs(60),
            "must not run indefinitely past the deadline"
        );

        let last = f.store.last_status();
        assert_eq!(last.state, ContributionState::Failure);
        assert!(last.messages.iter().any(|m| m.contains("timeout")));
        assert_eq!(f.notifier.templates(), vec![TEMPLATE_FAILURE.to_string()]);
    }

    /// Story: Install succeeding without a visible node waits for the
    /// deadline rather than claiming success
    #[tokio::test(start_paused = true)]
    async fn story_missing_node_after_install_waits_for_timeout() {
        let f = fixture(
            RecordingStore::default(), // no node object
            ScriptedTransport::new(vec![DialScript::Connect(ConnScript::default())]),
            RegistrationOutcome::Registered,
        );

        SetupProcedure::new(f.deps.clone(), setup_request(true)).run().await;

        let last = f.store.last_status();
        assert_eq!(last.state, ContributionState::Failure);
        assert!(last.messages.iter().any(|m| m.contains("timeout")));
        assert!(f.store.scheduling_calls.lock().unwrap().is_empty());
    }
}
