//! SSH-backed remote transport
//!
//! Production implementation of [`RemoteTransport`] over libssh2. All
//! libssh2 calls are blocking, so every operation moves the session onto a
//! blocking thread via `spawn_blocking` and moves it back when done; the
//! async traits the procedures see never block the runtime.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::Session;
use tracing::debug;

use super::{Credentials, RemoteConnection, RemoteError, RemoteTransport};

/// Transport that dials machines over SSH with password authentication
#[derive(Clone, Copy, Debug, Default)]
pub struct SshTransport;

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteConnection>, RemoteError> {
        let host = host.to_string();
        let credentials = credentials.clone();

        let session = tokio::task::spawn_blocking(move || dial_blocking(&host, port, &credentials, timeout))
            .await
            .map_err(|e| RemoteError::Session(e.to_string()))??;

        Ok(Box::new(SshConnection {
            session: Some(session),
        }))
    }
}

fn dial_blocking(
    host: &str,
    port: u16,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<Session, RemoteError> {
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|e| RemoteError::Resolve(e.to_string()))?
        .collect();

    let mut last_err = RemoteError::Resolve(format!("no addresses for {host}"));
    let mut stream = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => last_err = RemoteError::Dial(e.to_string()),
        }
    }
    let stream = stream.ok_or(last_err)?;

    let mut session = Session::new().map_err(|e| RemoteError::Session(e.to_string()))?;
    session.set_tcp_stream(stream);
    // Bound the handshake and authentication; long-running provisioning
    // commands get an unlimited session afterwards.
    session.set_timeout(timeout.as_millis() as u32);
    session
        .handshake()
        .map_err(|e| RemoteError::Dial(e.to_string()))?;
    session
        .userauth_password(&credentials.user, &credentials.password)
        .map_err(|e| RemoteError::Auth(e.to_string()))?;
    if !session.authenticated() {
        return Err(RemoteError::Auth("authentication incomplete".to_string()));
    }
    session.set_timeout(0);

    debug!(host = %host, port = port, "remote connection established");
    Ok(session)
}

/// An authenticated SSH connection
///
/// The session is moved onto a blocking thread for the duration of each
/// operation and restored afterwards.
pub struct SshConnection {
    session: Option<Session>,
}

impl SshConnection {
    async fn with_session<T, F>(&mut self, op: F) -> Result<T, RemoteError>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> Result<T, RemoteError> + Send + 'static,
    {
        let session = self
            .session
            .take()
            .ok_or_else(|| RemoteError::Session("connection closed".to_string()))?;

        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = op(&session);
            (session, result)
        })
        .await
        .map_err(|e| RemoteError::Session(e.to_string()))?;

        self.session = Some(session);
        result
    }
}

#[async_trait]
impl RemoteConnection for SshConnection {
    async fn exec_output(&mut self, command: &str) -> Result<Vec<u8>, RemoteError> {
        let command = command.to_string();
        self.with_session(move |session| {
            let mut channel = session
                .channel_session()
                .map_err(|e| RemoteError::Session(e.to_string()))?;
            channel
                .exec(&command)
                .map_err(|e| RemoteError::Session(e.to_string()))?;
            let mut output = Vec::new();
            channel
                .read_to_end(&mut output)
                .map_err(|e| RemoteError::Session(e.to_string()))?;
            let _ = channel.wait_close();
            Ok(output)
        })
        .await
    }

    async fn exec(&mut self, command: &str) -> Result<(), RemoteError> {
        let command = command.to_string();
        self.with_session(move |session| {
            let mut channel = session
                .channel_session()
                .map_err(|e| RemoteError::Session(e.to_string()))?;
            channel
                .exec(&command)
                .map_err(|e| RemoteError::Session(e.to_string()))?;
            let mut sink = Vec::new();
            let _ = channel.read_to_end(&mut sink);
            channel
                .wait_close()
                .map_err(|e| RemoteError::Session(e.to_string()))?;
            match channel.exit_status() {
                Ok(0) => Ok(()),
                Ok(code) => Err(RemoteError::CommandStream(format!(
                    "'{command}' exited with status {code}"
                ))),
                Err(e) => Err(RemoteError::Session(e.to_string())),
            }
        })
        .await
    }

    async fn run_sequential(&mut self, commands: &[String]) -> Result<(), RemoteError> {
        let commands = commands.to_vec();
        self.with_session(move |session| {
            let mut channel = session
                .channel_session()
                .map_err(|e| RemoteError::Session(e.to_string()))?;
            channel
                .shell()
                .map_err(|e| RemoteError::Session(e.to_string()))?;

            // The command list is small; it fits the stdin window entirely,
            // so all commands are written up front and the output drained
            // afterwards while the shell works through them.
            for command in &commands {
                writeln!(channel, "{command}")
                    .map_err(|e| RemoteError::CommandStream(e.to_string()))?;
            }
            channel
                .send_eof()
                .map_err(|e| RemoteError::CommandStream(e.to_string()))?;

            let mut sink = Vec::new();
            let _ = channel.read_to_end(&mut sink);
            channel
                .wait_close()
                .map_err(|e| RemoteError::Session(e.to_string()))?;
            match channel.exit_status() {
                Ok(0) => Ok(()),
                Ok(code) => Err(RemoteError::CommandStream(format!(
                    "shell exited with status {code}"
                ))),
                Err(e) => Err(RemoteError::Session(e.to_string())),
            }
        })
        .await
    }
}
