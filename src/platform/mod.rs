//! Backend-agnostic machine and cluster capabilities.
//!
//! Tests and the runner only ever see the trait objects defined here. Each
//! supported provider plugs in through [`crate::backend::Backend`] and is
//! wrapped by [`BackendCluster`], so there is one bookkeeping
//! implementation shared by every platform.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::ssh::SshError;

mod cluster;
mod discovery;

pub use cluster::{BackendCluster, BackendClusterFactory, ClusterOptions, MachineState};
pub use discovery::{DEFAULT_DISCOVERY_URL, DiscoveryClient};

/// Future returned by machine and cluster operations.
pub type PlatformFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PlatformError>> + Send + 'a>>;

/// Handle to one provisioned instance.
pub trait Machine: Send + Sync + fmt::Debug {
    /// Backend-assigned identifier, unique within the owning cluster.
    fn id(&self) -> &str;

    /// Public address.
    fn public_ip(&self) -> &str;

    /// Private-network address, or an empty string when the backend has no
    /// private network.
    fn private_ip(&self) -> &str;

    /// Runs `command` on the machine and returns its trimmed standard output.
    fn run_command<'a>(&'a self, command: &'a str) -> PlatformFuture<'a, String>;

    /// Destroys the instance and removes it from its cluster. Destroying an
    /// already destroyed machine succeeds without side effects.
    fn destroy(&self) -> PlatformFuture<'_, ()>;
}

/// Group of machines sharing a backend and configuration context.
pub trait Cluster: Send + Sync {
    /// Identifier of the platform backing this cluster.
    fn platform(&self) -> &str;

    /// Provisions one machine with the given boot configuration and waits
    /// until it accepts remote commands.
    fn create_machine<'a>(&'a self, boot_config: &'a str) -> PlatformFuture<'a, Arc<dyn Machine>>;

    /// Snapshot of the machines currently registered with the cluster.
    fn list_machines(&self) -> Vec<Arc<dyn Machine>>;

    /// Destroys every machine, continuing past individual failures. The
    /// machine set is always empty afterwards.
    fn destroy_all(&self) -> PlatformFuture<'_, ()>;

    /// Requests a fresh coordination endpoint for a cluster of `size`
    /// members.
    fn discovery_endpoint(&self, size: usize) -> PlatformFuture<'_, String>;
}

/// Builds independent clusters for one platform.
pub trait ClusterFactory: Send + Sync {
    /// Identifier of the platform the factory provisions on.
    fn platform(&self) -> &str;

    /// Creates an empty cluster.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError`] when the cluster's SSH agent cannot be
    /// prepared.
    fn new_cluster(&self) -> Result<Arc<dyn Cluster>, PlatformError>;
}

/// Errors raised by machine and cluster operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PlatformError {
    /// Raised when a remote command or connection fails.
    #[error(transparent)]
    Ssh(#[from] SshError),
    /// Raised when the backend rejects or fails instance creation.
    #[error("provisioning failed: {message}")]
    Provisioning {
        /// Backend error, with any cleanup failure appended.
        message: String,
    },
    /// Raised when a created instance never passes the readiness check.
    #[error("instance {instance_id} not reachable after {attempts} attempts: {message}")]
    ProvisioningTimeout {
        /// Provider identifier of the instance.
        instance_id: String,
        /// Readiness attempts made.
        attempts: u32,
        /// Last readiness error, with any cleanup failure appended.
        message: String,
    },
    /// Raised when an operation exceeds its deadline.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// Operation that was cancelled.
        operation: String,
        /// Deadline in whole seconds.
        seconds: u64,
    },
    /// Raised when one or more instances could not be destroyed.
    #[error("failed to destroy {count} instance(s): {summary}", count = .failures.len(), summary = .failures.join("; "))]
    Destroy {
        /// One entry per instance that failed to tear down.
        failures: Vec<String>,
    },
    /// Raised when a destroyed machine is asked to run a command.
    #[error("machine {id} has been destroyed")]
    AlreadyDestroyed {
        /// Identifier of the destroyed machine.
        id: String,
    },
    /// Raised when the discovery service cannot issue an endpoint.
    #[error("discovery endpoint request failed: {message}")]
    Discovery {
        /// Transport error or unexpected response.
        message: String,
    },
}
