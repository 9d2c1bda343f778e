//! Remote command execution over multiplexed SSH connections.
//!
//! [`SshAgent`] owns one identity and a cache of OpenSSH control-master
//! connections keyed by target address, so repeated commands against the
//! same machine reuse a single transport handshake. Every command runs as
//! its own `ssh` process over the shared control socket; the process is
//! killed if the caller stops waiting, so no session outlives its call.
//!
//! Nothing in this module retries. Callers that know an operation is
//! idempotent wrap it in [`crate::retry`].

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use tokio::sync::OnceCell;
use tokio::time::timeout;

mod config;
mod types;
mod util;

pub use config::{SSH_AUTH_SOCK_ENV, SshConfig, SshConfigLoadError, SshError, SshIdentity};
pub use types::{CommandOutput, CommandRunner, ProcessCommandRunner, RunnerFuture};
pub use util::expand_tilde;

/// Exit status OpenSSH reserves for its own transport or authentication
/// failures.
pub const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Command used to establish a connection; it has no remote side effects.
const CONNECT_CHECK: &str = "true";

/// An established connection to one address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Session {
    /// Target address.
    pub address: String,
    /// Control socket template shared by every session of the agent.
    pub control_path: Utf8PathBuf,
}

/// Runs commands on remote machines with one identity and connection reuse.
#[derive(Debug)]
pub struct SshAgent<R: CommandRunner> {
    config: SshConfig,
    identity: SshIdentity,
    runner: R,
    control_path: Utf8PathBuf,
    sessions: Mutex<HashMap<String, Arc<OnceCell<Session>>>>,
    _control_dir: TempDir,
}

impl SshAgent<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`SshError`] when the configuration is invalid or the control
    /// directory cannot be created.
    pub fn with_process_runner(config: SshConfig) -> Result<Self, SshError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SshAgent<R> {
    /// Creates an agent, resolving its identity and a private control
    /// directory for multiplexing sockets.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidConfig`] or [`SshError::AgentUnavailable`]
    /// when validation fails, and [`SshError::ControlDir`] when the control
    /// directory cannot be created.
    pub fn new(config: SshConfig, runner: R) -> Result<Self, SshError> {
        config.validate()?;
        let identity = config.identity()?;
        let control_dir = tempfile::Builder::new()
            .prefix("flotilla-ssh-")
            .tempdir()
            .map_err(|err| SshError::ControlDir {
                message: err.to_string(),
            })?;
        let control_path = Utf8PathBuf::from_path_buf(control_dir.path().join("%C")).map_err(
            |path| SshError::ControlDir {
                message: format!("non-UTF-8 control directory: {}", path.display()),
            },
        )?;

        Ok(Self {
            config,
            identity,
            runner,
            control_path,
            sessions: Mutex::new(HashMap::new()),
            _control_dir: control_dir,
        })
    }

    /// Returns the configuration the agent was built with.
    #[must_use]
    pub const fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Returns the identity presented to remote machines.
    #[must_use]
    pub const fn identity(&self) -> &SshIdentity {
        &self.identity
    }

    /// Returns the addresses with a cached, established connection.
    #[must_use]
    pub fn connected_addresses(&self) -> Vec<String> {
        let sessions = self.lock_sessions();
        let mut addresses: Vec<String> = sessions
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(address, _)| address.clone())
            .collect();
        addresses.sort();
        addresses
    }

    /// Establishes, or reuses, the connection to `address`.
    ///
    /// Concurrent callers for the same address share one establishment. A
    /// failed attempt leaves nothing cached, so a later call tries again.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Connection`] when the handshake or authentication
    /// fails, [`SshError::Timeout`] when it exceeds the connect deadline, and
    /// [`SshError::Spawn`] when `ssh` cannot be started.
    pub async fn connect(&self, address: &str) -> Result<Session, SshError> {
        let cell = {
            let mut sessions = self.lock_sessions();
            Arc::clone(sessions.entry(address.to_owned()).or_default())
        };

        let session = cell
            .get_or_try_init(|| self.establish(address))
            .await?
            .clone();
        Ok(session)
    }

    /// Runs `command` on `address` and returns its standard output with
    /// trailing whitespace trimmed.
    ///
    /// # Errors
    ///
    /// See [`SshAgent::run_with_timeout`].
    pub async fn run(&self, address: &str, command: &str) -> Result<String, SshError> {
        self.run_with_timeout(address, command, self.config.command_timeout())
            .await
    }

    /// Runs `command` on `address`, failing once `deadline` elapses.
    ///
    /// Remote standard error is forwarded to the diagnostic log in addition
    /// to being carried by [`SshError::CommandFailed`].
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Connection`] for transport failures (the cached
    /// connection is dropped), [`SshError::CommandFailed`] for a non-zero
    /// remote exit status, and [`SshError::Timeout`] when the deadline
    /// elapses.
    pub async fn run_with_timeout(
        &self,
        address: &str,
        command: &str,
        deadline: Duration,
    ) -> Result<String, SshError> {
        self.connect(address).await?;

        let args = self.command_args(address, command);
        let output = timeout(deadline, self.runner.run(&self.config.ssh_bin, &args))
            .await
            .map_err(|_| SshError::Timeout {
                address: address.to_owned(),
                seconds: deadline.as_secs(),
            })??;

        let stderr = output.stderr.trim_end();
        if !stderr.is_empty() {
            tracing::warn!(address, command, stderr, "remote command wrote to stderr");
        }

        match output.code {
            Some(0) => Ok(output.stdout.trim_end().to_owned()),
            Some(SSH_TRANSPORT_FAILURE) => {
                self.forget(address);
                Err(SshError::Connection {
                    address: address.to_owned(),
                    message: stderr.to_owned(),
                })
            }
            code => Err(SshError::CommandFailed {
                address: address.to_owned(),
                command: command.to_owned(),
                status: code,
                status_text: code.map_or_else(|| String::from("unknown"), |c| c.to_string()),
                stderr: stderr.to_owned(),
            }),
        }
    }

    /// Closes the cached connection to `address`, if any.
    pub async fn disconnect(&self, address: &str) {
        let cell = self.lock_sessions().remove(address);
        if let Some(session) = cell.as_deref().and_then(OnceCell::get) {
            self.exit_master(session).await;
        }
    }

    /// Closes every cached connection. Calling it again is a no-op.
    pub async fn close(&self) {
        let drained: Vec<Arc<OnceCell<Session>>> = {
            let mut sessions = self.lock_sessions();
            sessions.drain().map(|(_, cell)| cell).collect()
        };
        for cell in drained {
            if let Some(session) = cell.get() {
                self.exit_master(session).await;
            }
        }
    }

    async fn establish(&self, address: &str) -> Result<Session, SshError> {
        tracing::debug!(address, "opening SSH control connection");
        let args = self.command_args(address, CONNECT_CHECK);
        let deadline = self.config.connect_timeout();
        let output = timeout(deadline, self.runner.run(&self.config.ssh_bin, &args))
            .await
            .map_err(|_| SshError::Timeout {
                address: address.to_owned(),
                seconds: deadline.as_secs(),
            })??;

        if output.is_success() {
            return Ok(Session {
                address: address.to_owned(),
                control_path: self.control_path.clone(),
            });
        }

        Err(SshError::Connection {
            address: address.to_owned(),
            message: connection_message(&output),
        })
    }

    async fn exit_master(&self, session: &Session) {
        let mut args = vec![OsString::from("-O"), OsString::from("exit")];
        args.extend(self.common_options(&session.control_path));
        args.push(self.destination(&session.address));
        match self.runner.run(&self.config.ssh_bin, &args).await {
            Ok(output) if output.is_success() => {
                tracing::debug!(address = %session.address, "closed SSH control connection");
            }
            Ok(output) => {
                tracing::debug!(
                    address = %session.address,
                    stderr = output.stderr.trim_end(),
                    "SSH control connection already gone"
                );
            }
            Err(err) => {
                tracing::debug!(
                    address = %session.address,
                    error = %err,
                    "failed to close SSH control connection"
                );
            }
        }
    }

    fn forget(&self, address: &str) {
        self.lock_sessions().remove(address);
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<OnceCell<Session>>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn command_args(&self, address: &str, command: &str) -> Vec<OsString> {
        let mut args = self.common_options(&self.control_path);
        args.push(OsString::from("-o"));
        args.push(OsString::from("ControlMaster=auto"));
        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ControlPersist={}",
            self.config.control_persist_secs
        )));
        args.push(self.destination(address));
        args.push(OsString::from("--"));
        args.push(OsString::from(command));
        args
    }

    fn destination(&self, address: &str) -> OsString {
        OsString::from(format!("{}@{address}", self.config.ssh_user))
    }

    fn common_options(&self, control_path: &Utf8Path) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.config.ssh_port.to_string()),
        ];

        match &self.identity {
            SshIdentity::KeyFile(path) => {
                args.push(OsString::from("-i"));
                args.push(OsString::from(path));
                args.push(OsString::from("-o"));
                args.push(OsString::from("IdentitiesOnly=yes"));
            }
            SshIdentity::Agent { socket } => {
                args.push(OsString::from("-o"));
                args.push(OsString::from(format!("IdentityAgent={socket}")));
            }
            SshIdentity::SystemDefault => {}
        }

        if self.config.ssh_batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.ssh_strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.ssh_known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.ssh_known_hosts_file
            )));
        }

        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            self.config.connect_timeout_secs
        )));
        args.push(OsString::from("-o"));
        args.push(OsString::from(format!("ControlPath={control_path}")));
        args
    }
}

fn connection_message(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        let status = output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        format!("ssh exited with status {status}")
    } else {
        stderr.to_owned()
    }
}
