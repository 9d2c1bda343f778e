//! SSH client configuration and the errors raised by the command channel.
//!
//! [`SshConfig`] is loaded via `ortho-config`, which merges defaults,
//! configuration files, and environment variables (`FLOTILLA_SSH_*`).

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use super::util::expand_tilde;

/// Environment variable naming the running ssh-agent socket.
pub const SSH_AUTH_SOCK_ENV: &str = "SSH_AUTH_SOCK";

/// SSH settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "FLOTILLA_SSH",
    discovery(
        app_name = "flotilla",
        env_var = "FLOTILLA_CONFIG_PATH",
        config_file_name = "flotilla.toml",
        dotfile_name = ".flotilla.toml",
        project_file_name = "flotilla.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// TCP port of the remote SSH daemon.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; defaults to disabling it because
    /// every machine is freshly booted with a new host key.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; defaults to `/dev/null` for ephemeral hosts.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Path to the private key used to authenticate. Supports tilde
    /// expansion. Takes precedence over `use_agent`.
    pub ssh_identity_file: Option<String>,
    /// Authenticate with the identity held by the running ssh-agent
    /// (`SSH_AUTH_SOCK`).
    #[ortho_config(default = false)]
    pub use_agent: bool,
    /// Seconds allowed for the TCP connection and handshake.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
    /// Seconds allowed for a single remote command.
    #[ortho_config(default = 300)]
    pub command_timeout_secs: u64,
    /// Seconds an idle multiplexed connection stays open.
    #[ortho_config(default = 600)]
    pub control_persist_secs: u64,
}

/// Identity presented to remote machines.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SshIdentity {
    /// A private key file on disk (tilde already expanded).
    KeyFile(String),
    /// The identity held by a running ssh-agent.
    Agent {
        /// Socket path of the agent.
        socket: String,
    },
    /// Whatever the `ssh` client picks from its own configuration.
    SystemDefault,
}

/// Errors raised when loading the SSH configuration from layered sources.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SshConfigLoadError {
    /// Surfaces errors from the `ortho-config` loader.
    #[error("failed to load SSH configuration: {0}")]
    Parse(String),
}

impl SshConfig {
    /// Loads configuration using defaults, configuration files, and
    /// environment variables without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigLoadError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SshConfigLoadError> {
        Self::load_from_iter([std::ffi::OsString::from("flotilla")])
            .map_err(|err| SshConfigLoadError::Parse(err.to_string()))
    }

    /// Validates required values.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidConfig`] when a required field is blank or
    /// a timeout is zero.
    pub fn validate(&self) -> Result<(), SshError> {
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.ssh_user, "ssh_user")?;
        Self::require_optional_value(self.ssh_identity_file.as_deref(), "ssh_identity_file")?;
        if self.ssh_port == 0 {
            return Err(SshError::invalid("ssh_port"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(SshError::invalid("connect_timeout_secs"));
        }
        if self.command_timeout_secs == 0 {
            return Err(SshError::invalid("command_timeout_secs"));
        }
        Ok(())
    }

    /// Resolves the identity used to authenticate.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::AgentUnavailable`] when agent authentication is
    /// requested but `SSH_AUTH_SOCK` is not set.
    pub fn identity(&self) -> Result<SshIdentity, SshError> {
        if let Some(path) = &self.ssh_identity_file {
            return Ok(SshIdentity::KeyFile(expand_tilde(path.trim())));
        }
        if !self.use_agent {
            return Ok(SshIdentity::SystemDefault);
        }
        std::env::var(SSH_AUTH_SOCK_ENV)
            .ok()
            .filter(|socket| !socket.trim().is_empty())
            .map(|socket| SshIdentity::Agent { socket })
            .ok_or(SshError::AgentUnavailable)
    }

    /// Timeout applied to connection establishment.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Timeout applied to a single remote command.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), SshError> {
        match value {
            None => Ok(()),
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(SshError::invalid(field)),
        }
    }

    fn require_value(value: &str, field: &str) -> Result<(), SshError> {
        Self::require_optional_value(Some(value), field)
    }
}

/// Errors surfaced by the remote command channel.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// Raised when configuration is missing required values.
    #[error("missing or invalid {field}: set FLOTILLA_SSH_{env_suffix} or add {field} to [ssh] in flotilla.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when agent authentication is requested without a running agent.
    #[error("use_agent is set but SSH_AUTH_SOCK is not")]
    AgentUnavailable,
    /// Raised when the private control directory cannot be created.
    #[error("failed to prepare SSH control directory: {message}")]
    ControlDir {
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the transport or authentication fails.
    #[error("cannot connect to {address}: {message}")]
    Connection {
        /// Target address.
        address: String,
        /// Diagnostic reported by the client.
        message: String,
    },
    /// Raised when the remote command exits with a non-zero status.
    #[error("`{command}` on {address} exited with status {status_text}: {stderr}")]
    CommandFailed {
        /// Target address.
        address: String,
        /// Command line that was executed.
        command: String,
        /// Exit status, when the process was not killed by a signal.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the remote process.
        stderr: String,
    },
    /// Raised when a connection or command exceeds its deadline.
    #[error("timed out after {seconds}s talking to {address}")]
    Timeout {
        /// Target address.
        address: String,
        /// Deadline that elapsed, in whole seconds.
        seconds: u64,
    },
}

impl SshError {
    fn invalid(field: &str) -> Self {
        Self::InvalidConfig {
            field: field.to_owned(),
        }
    }
}
