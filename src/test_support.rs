//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::ssh::{CommandOutput, CommandRunner, RunnerFuture, SSH_TRANSPORT_FAILURE, SshConfig, SshError};

/// SSH configuration with fast timeouts and no identity file.
#[must_use]
pub fn ssh_config() -> SshConfig {
    SshConfig {
        ssh_bin: String::from("ssh"),
        ssh_user: String::from("core"),
        ssh_port: 22,
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        ssh_identity_file: None,
        use_agent: false,
        connect_timeout_secs: 5,
        command_timeout_secs: 30,
        control_persist_secs: 60,
    }
}

/// Records a single invocation made through a test runner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Returns `true` when this invocation closes a control connection.
    #[must_use]
    pub fn is_control_exit(&self) -> bool {
        self.args.first().is_some_and(|arg| arg == "-O")
    }

    /// Returns the `user@host` destination and remote command, when present.
    #[must_use]
    pub fn remote_command(&self) -> Option<(String, String)> {
        let separator = self.args.iter().position(|arg| arg == "--")?;
        let destination = self.args.get(separator.checked_sub(1)?)?;
        let command = self.args.get(separator + 1)?;
        let host = destination
            .to_string_lossy()
            .rsplit('@')
            .next()
            .map(str::to_owned)?;
        Some((host, command.to_string_lossy().into_owned()))
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an OpenSSH transport failure.
    pub fn push_connection_failure(&self) {
        self.push_output(
            Some(SSH_TRANSPORT_FAILURE),
            "",
            "ssh: connect to host port 22: Connection refused",
        );
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(CommandOutput {
                code,
                stdout: stdout.into(),
                stderr: stderr.into(),
            });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
            });
        let response = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| SshError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            });
        Box::pin(std::future::ready(response))
    }
}

/// Simulated fleet of SSH hosts.
///
/// Every host is reachable and answers every command with empty output
/// unless told otherwise. Closing a control connection always succeeds.
#[derive(Clone, Debug, Default)]
pub struct FakeSshRunner {
    state: Arc<Mutex<FakeSshState>>,
}

#[derive(Debug, Default)]
struct FakeSshState {
    failures_left: HashMap<String, u32>,
    responses: Vec<(String, String)>,
    executed: Vec<(String, String)>,
    refused: u32,
}

impl FakeSshRunner {
    /// Creates a runner where every host is reachable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `host` refuse every connection.
    pub fn unreachable(&self, host: &str) {
        self.unreachable_for(host, u32::MAX);
    }

    /// Makes `host` refuse the next `attempts` connections.
    pub fn unreachable_for(&self, host: &str, attempts: u32) {
        self.lock().failures_left.insert(host.to_owned(), attempts);
    }

    /// Answers commands containing `fragment` with `stdout`.
    pub fn respond(&self, fragment: &str, stdout: &str) {
        self.lock()
            .responses
            .push((fragment.to_owned(), stdout.to_owned()));
    }

    /// Returns `(host, command)` pairs that reached a host, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<(String, String)> {
        self.lock().executed.clone()
    }

    /// Returns the commands that reached `host`, in order.
    #[must_use]
    pub fn executed_on(&self, host: &str) -> Vec<String> {
        self.lock()
            .executed
            .iter()
            .filter(|(target, _)| target == host)
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Returns how many connection attempts were refused.
    #[must_use]
    pub fn refused(&self) -> u32 {
        self.lock().refused
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeSshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn answer(&self, invocation: &CommandInvocation) -> CommandOutput {
        if invocation.is_control_exit() {
            return success(String::new());
        }
        let Some((host, command)) = invocation.remote_command() else {
            return CommandOutput {
                code: Some(SSH_TRANSPORT_FAILURE),
                stdout: String::new(),
                stderr: String::from("usage: ssh destination [command]"),
            };
        };

        let mut state = self.lock();
        if let Some(left) = state.failures_left.get_mut(&host)
            && *left > 0
        {
            *left = left.saturating_sub(1);
            state.refused += 1;
            return CommandOutput {
                code: Some(SSH_TRANSPORT_FAILURE),
                stdout: String::new(),
                stderr: format!("ssh: connect to host {host} port 22: Connection refused"),
            };
        }

        let stdout = state
            .responses
            .iter()
            .find(|(fragment, _)| command.contains(fragment.as_str()))
            .map(|(_, stdout)| stdout.clone())
            .unwrap_or_default();
        state.executed.push((host, command));
        success(stdout)
    }
}

const fn success(stdout: String) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout,
        stderr: String::new(),
    }
}

impl CommandRunner for FakeSshRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a> {
        let invocation = CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        };
        Box::pin(std::future::ready(Ok(self.answer(&invocation))))
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Removes an environment variable while holding the global mutex.
    pub async fn remove_var(key: &str) -> Self {
        let guard = ENV_LOCK.lock().await;
        let old = env::var_os(key);
        // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
        unsafe { env::remove_var(key) };
        Self {
            previous: vec![(key.to_owned(), old)],
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
