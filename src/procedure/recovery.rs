//! Recovery procedure: drive an existing, unready node back to readiness
//!
//! ```text
//! Recover -> Connect -> Reconfigure -> Reboot -> Reconnect (<=3 attempts)
//!         -> Reinstall -> (readiness watch observes Ready) -> Success
//! ```
//!
//! A readiness watcher runs concurrently with every step and short-circuits
//! the procedure the moment the node reports Ready (Success) or disappears
//! (end without a terminal state). Reconfigure and reboot failures are
//! recorded but non-fatal; dial and reinstall failures are terminal. The
//! whole run is bounded by the 25-minute deadline.
//!
//! The control task owns all state and receives typed [`RecoverySignal`]s
//! from detached worker tasks; fixed settle windows between steps are
//! detached timers posting signals, so the control task never sleeps
//! through its own deadline.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cluster::NodeWatchEvent;
use crate::crd::ContributionState;
use crate::node::ReadyState;
use crate::remote::commands::REBOOT_COMMAND;
use crate::remote::{clean_installation, reconfigure, Credentials, RemoteConnection, RemoteError};

use super::{
    ProcedureDeps, RecoveryRequest, StatusRecorder, DIAL_TIMEOUT, MAX_RECONNECT_ATTEMPTS,
    PROCEDURE_TIMEOUT, SETTLE_DELAY,
};

pub(crate) const MSG_RECOVERING: &str = "Node recovering";
pub(crate) const MSG_HANDSHAKE_FAILED: &str = "Node recovery failed: SSH handshake failed";
pub(crate) const MSG_RECONFIGURE_FAILED: &str = "Node recovery failed: reconfiguration step";
pub(crate) const MSG_REBOOT_FAILED: &str = "Node recovery failed: reboot step";
pub(crate) const MSG_REINSTALL_FAILED: &str = "Node recovery failed: installation step";
pub(crate) const MSG_TIMEOUT: &str = "Node recovery failed: timeout";
pub(crate) const MSG_RECOVERED: &str = "Node recovery successful";

type Conn = Box<dyn RemoteConnection>;

/// Completion signals posted by recovery worker tasks
enum RecoverySignal {
    /// The readiness watch observed a node change
    NodeChanged(ReadyState),
    /// The readiness watch observed the node's deletion
    NodeDeleted,
    /// Initial dial finished
    Dialed(Result<Conn, RemoteError>),
    /// Reconfiguration session finished; the connection comes back for the
    /// reboot step
    Reconfigured {
        /// The still-open connection
        conn: Conn,
        /// Outcome of the reconfigure session (non-fatal)
        result: Result<(), RemoteError>,
    },
    /// The post-reconfigure settle window elapsed
    SettleElapsed(Conn),
    /// Reboot was issued and the connection closed
    Rebooted(Result<(), RemoteError>),
    /// A reconnect window elapsed; dial again
    Reconnect,
    /// Post-reboot dial finished
    Redialed(Result<Conn, RemoteError>),
    /// Clean reinstallation finished
    Installed(Result<(), RemoteError>),
}

/// One run of the recovery state machine
pub struct RecoveryProcedure {
    deps: Arc<ProcedureDeps>,
    request: RecoveryRequest,
    recorder: StatusRecorder,
    reconnect_attempts: u32,
}

impl RecoveryProcedure {
    /// Build a procedure instance for the given request
    pub fn new(deps: Arc<ProcedureDeps>, request: RecoveryRequest) -> Self {
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
            reconnect_attempts: 0,
        }
    }

    /// Run the procedure to completion
    pub async fn run(mut self) {
        info!(
            key = %self.request.key,
            node = %self.request.node_name,
            "recovery procedure started"
        );
        self.recorder
            .record(ContributionState::Recover, MSG_RECOVERING)
            .await;

        let (tx, mut rx) = mpsc::channel::<RecoverySignal>(8);

        // Readiness watcher: short-circuits the procedure on Ready or
        // deletion from any state
        let watch = match self.deps.store.watch_node(&self.request.node_name).await {
            Ok(stream) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut stream = stream;
                    use futures::StreamExt;
                    while let Some(event) = stream.next().await {
                        let signal = match event {
                            NodeWatchEvent::Changed(ready) => RecoverySignal::NodeChanged(ready),
                            NodeWatchEvent::Deleted => RecoverySignal::NodeDeleted,
                        };
                        if tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                })
            }
            Err(e) => {
                // Without the readiness watch the procedure cannot observe
                // its own success; end immediately.
                warn!(key = %self.request.key, error = %e, "node watch failed, ending recovery");
                self.recorder.notify().await;
                return;
            }
        };

        self.spawn_dial(&tx, false);

        let deadline = tokio::time::sleep(PROCEDURE_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(key = %self.request.key, "recovery procedure timed out");
                    self.recorder
                        .record(ContributionState::Failure, MSG_TIMEOUT)
                        .await;
                    break;
                }
                signal = rx.recv() => {
                    let Some(signal) = signal else { break };
                    if self.step(signal, &tx).await.is_break() {
                        break;
                    }
                }
            }
        }

        watch.abort();
        self.recorder.notify().await;
        info!(
            key = %self.request.key,
            state = %self.recorder.state(),
            "recovery procedure finished"
        );
    }

    /// Advance the state machine on one signal
    async fn step(
        &mut self,
        signal: RecoverySignal,
        tx: &mpsc::Sender<RecoverySignal>,
    ) -> std::ops::ControlFlow<()> {
        use std::ops::ControlFlow;

        match signal {
            RecoverySignal::NodeChanged(ready) => {
                if ready.is_ready() {
                    info!(node = %self.request.node_name, "node became ready during recovery");
                    self.recorder
                        .replace(ContributionState::Success, MSG_RECOVERED)
                        .await;
                    return ControlFlow::Break(());
                }
                debug!(node = %self.request.node_name, ready = ?ready, "node still unready");
            }
            RecoverySignal::NodeDeleted => {
                warn!(node = %self.request.node_name, "node deleted during recovery");
                return ControlFlow::Break(());
            }
            RecoverySignal::Dialed(Err(e)) => {
                // Initial connect: no retry at this stage
                warn!(key = %self.request.key, error = %e, "initial dial failed");
                self.recorder
                    .record(ContributionState::Failure, MSG_HANDSHAKE_FAILED)
                    .await;
                return ControlFlow::Break(());
            }
            RecoverySignal::Dialed(Ok(conn)) => {
                self.spawn_reconfigure(conn, tx);
            }
            RecoverySignal::Reconfigured { conn, result } => {
                if let Err(e) = result {
                    warn!(key = %self.request.key, error = %e, "reconfiguration failed");
                    self.recorder.append(MSG_RECONFIGURE_FAILED).await;
                }
                // Let the runtime settle before rebooting
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(SETTLE_DELAY).await;
                    let _ = tx.send(RecoverySignal::SettleElapsed(conn)).await;
                });
            }
            RecoverySignal::SettleElapsed(conn) => {
                self.spawn_reboot(conn, tx);
            }
            RecoverySignal::Rebooted(result) => {
                if let Err(e) = result {
                    warn!(key = %self.request.key, error = %e, "reboot command failed");
                    self.recorder.append(MSG_REBOOT_FAILED).await;
                }
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(SETTLE_DELAY).await;
                    let _ = tx.send(RecoverySignal::Reconnect).await;
                });
            }
            RecoverySignal::Reconnect => {
                self.spawn_dial(tx, true);
            }
            RecoverySignal::Redialed(Err(e)) => {
                self.reconnect_attempts += 1;
                if self.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
                    warn!(
                        key = %self.request.key,
                        attempts = self.reconnect_attempts,
                        error = %e,
                        "reconnect attempts exhausted"
                    );
                    self.recorder
                        .record(ContributionState::Failure, MSG_HANDSHAKE_FAILED)
                        .await;
                    return ControlFlow::Break(());
                }
                debug!(
                    key = %self.request.key,
                    attempt = self.reconnect_attempts,
                    error = %e,
                    "reconnect failed, backing off"
                );
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(SETTLE_DELAY).await;
                    let _ = tx.send(RecoverySignal::Reconnect).await;
                });
            }
            RecoverySignal::Redialed(Ok(conn)) => {
                if !self.start_installation(conn, tx).await {
                    return ControlFlow::Break(());
                }
            }
            RecoverySignal::Installed(Err(e)) => {
                warn!(key = %self.request.key, error = %e, "reinstallation failed");
                self.recorder
                    .record(ContributionState::Failure, MSG_REINSTALL_FAILED)
                    .await;
                return ControlFlow::Break(());
            }
            RecoverySignal::Installed(Ok(())) => {
                // Nothing more to drive; the readiness watcher observes the
                // rejoined node and ends the procedure.
                debug!(node = %self.request.node_name, "reinstallation complete, awaiting readiness");
            }
        }
        ControlFlow::Continue(())
    }

    /// Dial the remote host in a worker task
    ///
    /// The first dial reports as `Dialed`, post-reboot dials as `Redialed`.
    fn spawn_dial(&self, tx: &mpsc::Sender<RecoverySignal>, reconnect: bool) {
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
            let signal = if reconnect {
                RecoverySignal::Redialed(result)
            } else {
                RecoverySignal::Dialed(result)
            };
            let _ = tx.send(signal).await;
        });
    }

    /// Run the reconfiguration session in a worker task
    fn spawn_reconfigure(&self, mut conn: Conn, tx: &mpsc::Sender<RecoverySignal>) {
        let node_name = self.request.node_name.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = reconfigure(conn.as_mut(), &node_name).await;
            let _ = tx.send(RecoverySignal::Reconfigured { conn, result }).await;
        });
    }

    /// Issue the delayed reboot and close the connection in a worker task
    fn spawn_reboot(&self, mut conn: Conn, tx: &mpsc::Sender<RecoverySignal>) {
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = conn.exec(REBOOT_COMMAND).await;
            drop(conn); // close before the machine goes down
            let _ = tx.send(RecoverySignal::Rebooted(result)).await;
        });
    }

    /// Issue a fresh join token and run the clean reinstallation in a
    /// worker task
    ///
    /// Returns false when the procedure must end (token issuance failed).
    async fn start_installation(
        &mut self,
        mut conn: Conn,
        tx: &mpsc::Sender<RecoverySignal>,
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
                    .record(ContributionState::Failure, MSG_REINSTALL_FAILED)
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
            let _ = tx.send(RecoverySignal::Installed(result)).await;
        });
        true
    }
}
