//! Cluster bookkeeping shared by every backend.
//!
//! [`BackendCluster`] drives a [`Backend`] through the machine lifecycle
//! (`Requested → Provisioning → Reachable → Destroyed`) and keeps two
//! guarded sets: instances still being provisioned, keyed by the name the
//! cluster gave them, and reachable machines keyed by provider identifier.
//! Keeping pending instances visible means an interrupted provisioning call
//! can still be torn down by [`Cluster::destroy_all`].

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::backend::{Backend, InstanceHandle, InstanceRequest};
use crate::retry::RetryPolicy;
use crate::ssh::{CommandRunner, SshAgent, SshConfig};

use super::{Cluster, ClusterFactory, DiscoveryClient, Machine, PlatformError, PlatformFuture};

const READINESS_CHECK: &str = "true";
const DEFAULT_READINESS_ATTEMPTS: u32 = 20;
const DEFAULT_READINESS_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(600);

/// Tunables applied to every machine a cluster provisions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClusterOptions {
    /// Retry budget for the SSH readiness check.
    pub readiness: RetryPolicy,
    /// Upper bound on one whole `create_machine` call.
    pub provision_timeout: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            readiness: RetryPolicy::new(DEFAULT_READINESS_ATTEMPTS, DEFAULT_READINESS_DELAY),
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
        }
    }
}

/// Lifecycle stage of one instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MachineState {
    /// Name allocated, creation request not yet acknowledged.
    Requested,
    /// Created at the provider, not yet accepting commands.
    Provisioning,
    /// Accepting remote commands.
    Reachable,
    /// Torn down. Terminal.
    Destroyed,
}

#[derive(Debug)]
struct PendingInstance {
    state: MachineState,
    handle: Option<InstanceHandle>,
}

struct Registry<B: Backend, R: CommandRunner> {
    pending: HashMap<String, PendingInstance>,
    live: HashMap<String, Arc<BackendMachine<B, R>>>,
}

struct Inner<B: Backend, R: CommandRunner> {
    platform: String,
    backend: B,
    agent: SshAgent<R>,
    options: ClusterOptions,
    discovery: DiscoveryClient,
    registry: Mutex<Registry<B, R>>,
    creates: TaskTracker,
}

/// [`Cluster`] implementation over any [`Backend`].
pub struct BackendCluster<B: Backend, R: CommandRunner> {
    inner: Arc<Inner<B, R>>,
}

impl<B: Backend, R: CommandRunner + 'static> BackendCluster<B, R> {
    /// Creates an empty cluster that provisions through `backend` and runs
    /// commands through `agent`.
    #[must_use]
    pub fn new(
        platform: impl Into<String>,
        backend: B,
        agent: SshAgent<R>,
        options: ClusterOptions,
        discovery: DiscoveryClient,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                platform: platform.into(),
                backend,
                agent,
                options,
                discovery,
                registry: Mutex::new(Registry {
                    pending: HashMap::new(),
                    live: HashMap::new(),
                }),
                creates: TaskTracker::new(),
            }),
        }
    }

    /// Returns the state of every instance the cluster still tracks, pending
    /// and reachable, sorted by name or identifier.
    #[must_use]
    pub fn instance_states(&self) -> Vec<(String, MachineState)> {
        let registry = self.inner.lock_registry();
        let mut states: Vec<(String, MachineState)> = registry
            .pending
            .iter()
            .map(|(name, pending)| (name.clone(), pending.state))
            .chain(
                registry
                    .live
                    .iter()
                    .map(|(id, machine)| (id.clone(), machine.state())),
            )
            .collect();
        states.sort_by(|lhs, rhs| lhs.0.cmp(&rhs.0));
        states
    }
}

impl<B: Backend, R: CommandRunner + 'static> Cluster for BackendCluster<B, R> {
    fn platform(&self) -> &str {
        &self.inner.platform
    }

    fn create_machine<'a>(&'a self, boot_config: &'a str) -> PlatformFuture<'a, Arc<dyn Machine>> {
        Box::pin(async move {
            let name = format!("flotilla-{}", Uuid::new_v4().simple());
            let deadline = self.inner.options.provision_timeout;
            match timeout(deadline, self.inner.provision(&name, boot_config)).await {
                Ok(result) => result.map(|machine| machine as Arc<dyn Machine>),
                Err(_) => {
                    let note = self.inner.abandon(&name, "provisioning timed out").await;
                    tracing::warn!(machine = %name, %note, "provisioning deadline elapsed");
                    Err(PlatformError::Timeout {
                        operation: format!("provisioning {name}"),
                        seconds: deadline.as_secs(),
                    })
                }
            }
        })
    }

    fn list_machines(&self) -> Vec<Arc<dyn Machine>> {
        self.inner
            .lock_registry()
            .live
            .values()
            .filter(|machine| machine.state() != MachineState::Destroyed)
            .map(|machine| Arc::clone(machine) as Arc<dyn Machine>)
            .collect()
    }

    fn destroy_all(&self) -> PlatformFuture<'_, ()> {
        Box::pin(async move { self.inner.destroy_all().await })
    }

    fn discovery_endpoint(&self, size: usize) -> PlatformFuture<'_, String> {
        Box::pin(async move { self.inner.discovery.new_endpoint(size).await })
    }
}

impl<B: Backend, R: CommandRunner + 'static> Inner<B, R> {
    fn lock_registry(&self) -> MutexGuard<'_, Registry<B, R>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn provision(
        self: &Arc<Self>,
        name: &str,
        boot_config: &str,
    ) -> Result<Arc<BackendMachine<B, R>>, PlatformError> {
        let request = InstanceRequest::builder()
            .name(name)
            .boot_config(boot_config)
            .build()
            .map_err(|err| PlatformError::Provisioning {
                message: err.to_string(),
            })?;

        self.lock_registry().pending.insert(
            name.to_owned(),
            PendingInstance {
                state: MachineState::Requested,
                handle: None,
            },
        );
        tracing::info!(platform = %self.platform, machine = name, "requesting instance");

        let create = self
            .creates
            .spawn(Arc::clone(self).create_instance(name.to_owned(), request));
        let handle = match create.await {
            Ok(created) => created?,
            Err(err) => {
                self.lock_registry().pending.remove(name);
                return Err(PlatformError::Provisioning {
                    message: format!("create task for {name} failed: {err}"),
                });
            }
        };

        let networking = match self.backend.wait_for_ready(&handle).await {
            Ok(networking) => networking,
            Err(err) => {
                return Err(PlatformError::Provisioning {
                    message: self.abandon(name, &err).await,
                });
            }
        };

        let address = networking.public_ip.to_string();
        let policy = self.options.readiness;
        if let Err(err) = policy
            .run(|| self.agent.run(&address, READINESS_CHECK))
            .await
        {
            return Err(PlatformError::ProvisioningTimeout {
                instance_id: handle.id,
                attempts: policy.attempts.max(1),
                message: self.abandon(name, &err).await,
            });
        }

        let machine = Arc::new(BackendMachine {
            id: handle.id.clone(),
            public_ip: address,
            private_ip: networking
                .private_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            handle,
            state: Mutex::new(MachineState::Reachable),
            cluster: Arc::downgrade(self),
        });
        if !self.promote(name, &machine) {
            return Err(PlatformError::Provisioning {
                message: self.torn_down_underneath(&machine.handle),
            });
        }
        tracing::info!(
            platform = %self.platform,
            machine = %machine.id,
            address = %machine.public_ip,
            "machine reachable"
        );
        Ok(machine)
    }

    /// Creates the instance and records its handle. Runs as a tracked task so
    /// the handle is recorded even when the caller is dropped mid-call; an
    /// instance whose pending entry is already gone is destroyed here.
    async fn create_instance(
        self: Arc<Self>,
        name: String,
        request: InstanceRequest,
    ) -> Result<InstanceHandle, PlatformError> {
        let handle = match self.backend.create(&request).await {
            Ok(handle) => handle,
            Err(err) => {
                self.lock_registry().pending.remove(&name);
                return Err(PlatformError::Provisioning {
                    message: err.to_string(),
                });
            }
        };
        if self.mark_provisioning(&name, &handle) {
            return Ok(handle);
        }
        let message = self.torn_down_underneath(&handle);
        let teardown_error = self.backend.destroy(handle).await.err();
        if let Some(err) = &teardown_error {
            tracing::warn!(machine = %name, error = %err, "failed to destroy orphaned instance");
        }
        Err(PlatformError::Provisioning {
            message: append_teardown_note(message, teardown_error.as_ref()),
        })
    }

    /// Records the provider handle for a pending instance. Returns `false`
    /// when the cluster was torn down while the create call was in flight.
    fn mark_provisioning(&self, name: &str, handle: &InstanceHandle) -> bool {
        let mut registry = self.lock_registry();
        let Some(pending) = registry.pending.get_mut(name) else {
            return false;
        };
        pending.state = MachineState::Provisioning;
        pending.handle = Some(handle.clone());
        true
    }

    /// Moves a machine from the pending to the live set. Returns `false` when
    /// the cluster was torn down in the meantime; the instance was then
    /// destroyed along with the rest of the pending set.
    fn promote(&self, name: &str, machine: &Arc<BackendMachine<B, R>>) -> bool {
        let mut registry = self.lock_registry();
        if registry.pending.remove(name).is_none() {
            return false;
        }
        registry
            .live
            .insert(machine.id.clone(), Arc::clone(machine));
        true
    }

    fn torn_down_underneath(&self, handle: &InstanceHandle) -> String {
        tracing::warn!(
            platform = %self.platform,
            machine = %handle.id,
            "cluster destroyed while instance was provisioning"
        );
        format!("cluster destroyed while {} was provisioning", handle.id)
    }

    /// Drops a pending instance and destroys it at the provider when it was
    /// already created. Returns `err` with any teardown failure appended.
    async fn abandon<E: Display + ?Sized>(&self, name: &str, err: &E) -> String {
        let pending = self.lock_registry().pending.remove(name);
        let Some(handle) = pending.and_then(|pending| pending.handle) else {
            return err.to_string();
        };
        let teardown_error = self.backend.destroy(handle).await.err();
        append_teardown_note(err.to_string(), teardown_error.as_ref())
    }

    /// Destroys every tracked instance once in-flight creates have settled.
    /// Machines whose own destroy is still running are left to that call.
    async fn destroy_all(&self) -> Result<(), PlatformError> {
        self.creates.close();
        self.creates.wait().await;
        self.creates.reopen();

        let (machines, pending) = {
            let mut registry = self.lock_registry();
            let retiring: Vec<String> = registry
                .live
                .iter()
                .filter(|(_, machine)| machine.state() != MachineState::Destroyed)
                .map(|(id, _)| id.clone())
                .collect();
            let machines: Vec<Arc<BackendMachine<B, R>>> = retiring
                .iter()
                .filter_map(|id| registry.live.remove(id))
                .collect();
            for machine in &machines {
                *machine.lock_state() = MachineState::Destroyed;
            }
            let pending: Vec<InstanceHandle> = registry
                .pending
                .drain()
                .filter_map(|(_, pending)| pending.handle)
                .collect();
            (machines, pending)
        };
        tracing::info!(
            platform = %self.platform,
            machines = machines.len(),
            pending = pending.len(),
            "destroying cluster"
        );

        let mut failures = Vec::new();
        for machine in machines {
            if let Err(err) = self.backend.destroy(machine.handle.clone()).await {
                tracing::warn!(machine = %machine.id, error = %err, "failed to destroy machine");
                failures.push(format!("{}: {err}", machine.id));
            }
        }
        for handle in pending {
            if let Err(err) = self.backend.destroy(handle.clone()).await {
                tracing::warn!(machine = %handle.id, error = %err, "failed to destroy pending instance");
                failures.push(format!("{}: {err}", handle.id));
            }
        }
        self.agent.close().await;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PlatformError::Destroy { failures })
        }
    }

    /// Marks `machine` destroyed. It stays in the live set until the
    /// provider confirms teardown. Returns `false` when it was already
    /// destroyed.
    fn retire(&self, machine: &BackendMachine<B, R>) -> bool {
        let _registry = self.lock_registry();
        let mut state = machine.lock_state();
        if *state == MachineState::Destroyed {
            return false;
        }
        *state = MachineState::Destroyed;
        true
    }

    /// Settles a machine-level destroy: drops the machine from the live set
    /// on success, or makes it reachable again so a later destroy retries.
    fn settle(&self, machine: &BackendMachine<B, R>, destroyed: bool) {
        let mut registry = self.lock_registry();
        if destroyed {
            registry.live.remove(&machine.id);
        } else if registry.live.contains_key(&machine.id) {
            *machine.lock_state() = MachineState::Reachable;
        }
    }
}

/// [`Machine`] handle produced by [`BackendCluster`].
struct BackendMachine<B: Backend, R: CommandRunner> {
    id: String,
    public_ip: String,
    private_ip: String,
    handle: InstanceHandle,
    state: Mutex<MachineState>,
    cluster: Weak<Inner<B, R>>,
}

impl<B: Backend, R: CommandRunner> BackendMachine<B, R> {
    fn lock_state(&self) -> MutexGuard<'_, MachineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MachineState {
        *self.lock_state()
    }

    fn already_destroyed(&self) -> PlatformError {
        PlatformError::AlreadyDestroyed {
            id: self.id.clone(),
        }
    }
}

impl<B: Backend, R: CommandRunner> fmt::Debug for BackendMachine<B, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendMachine")
            .field("id", &self.id)
            .field("public_ip", &self.public_ip)
            .field("private_ip", &self.private_ip)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<B: Backend, R: CommandRunner + 'static> Machine for BackendMachine<B, R> {
    fn id(&self) -> &str {
        &self.id
    }

    fn public_ip(&self) -> &str {
        &self.public_ip
    }

    fn private_ip(&self) -> &str {
        &self.private_ip
    }

    fn run_command<'a>(&'a self, command: &'a str) -> PlatformFuture<'a, String> {
        Box::pin(async move {
            if self.state() == MachineState::Destroyed {
                return Err(self.already_destroyed());
            }
            let cluster = self.cluster.upgrade().ok_or_else(|| self.already_destroyed())?;
            tracing::debug!(machine = %self.id, command, "running remote command");
            Ok(cluster.agent.run(&self.public_ip, command).await?)
        })
    }

    fn destroy(&self) -> PlatformFuture<'_, ()> {
        Box::pin(async move {
            let Some(cluster) = self.cluster.upgrade() else {
                *self.lock_state() = MachineState::Destroyed;
                return Ok(());
            };
            if !cluster.retire(self) {
                tracing::debug!(machine = %self.id, "machine already destroyed");
                return Ok(());
            }

            tracing::info!(machine = %self.id, "destroying machine");
            let result = cluster.backend.destroy(self.handle.clone()).await;
            cluster.settle(self, result.is_ok());
            cluster.agent.disconnect(&self.public_ip).await;
            result.map_err(|err| {
                tracing::warn!(machine = %self.id, error = %err, "failed to destroy machine");
                PlatformError::Destroy {
                    failures: vec![format!("{}: {err}", self.id)],
                }
            })
        })
    }
}

/// [`ClusterFactory`] that builds a [`BackendCluster`] with a fresh SSH agent
/// per call.
pub struct BackendClusterFactory<B, R> {
    platform: String,
    backend: B,
    runner: R,
    ssh: SshConfig,
    options: ClusterOptions,
    discovery: DiscoveryClient,
}

impl<B, R> BackendClusterFactory<B, R>
where
    B: Backend + Clone,
    R: CommandRunner + Clone + 'static,
{
    /// Creates a factory for `platform`.
    #[must_use]
    pub fn new(platform: impl Into<String>, backend: B, runner: R, ssh: SshConfig) -> Self {
        Self {
            platform: platform.into(),
            backend,
            runner,
            ssh,
            options: ClusterOptions::default(),
            discovery: DiscoveryClient::default(),
        }
    }

    /// Overrides the readiness and provisioning budgets.
    #[must_use]
    pub const fn with_options(mut self, options: ClusterOptions) -> Self {
        self.options = options;
        self
    }

    /// Overrides the discovery service.
    #[must_use]
    pub fn with_discovery(mut self, discovery: DiscoveryClient) -> Self {
        self.discovery = discovery;
        self
    }

    /// Builds a concrete cluster, bypassing the trait object.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Ssh`] when the SSH agent cannot be created.
    pub fn build(&self) -> Result<BackendCluster<B, R>, PlatformError> {
        let agent = SshAgent::new(self.ssh.clone(), self.runner.clone())?;
        Ok(BackendCluster::new(
            self.platform.clone(),
            self.backend.clone(),
            agent,
            self.options,
            self.discovery.clone(),
        ))
    }
}

impl<B, R> ClusterFactory for BackendClusterFactory<B, R>
where
    B: Backend + Clone,
    R: CommandRunner + Clone + 'static,
{
    fn platform(&self) -> &str {
        &self.platform
    }

    fn new_cluster(&self) -> Result<Arc<dyn Cluster>, PlatformError> {
        Ok(Arc::new(self.build()?))
    }
}

fn append_teardown_note<E: Display>(message: String, teardown_error: Option<&E>) -> String {
    if let Some(teardown) = teardown_error {
        format!("{message} (teardown also failed: {teardown})")
    } else {
        message
    }
}
