//! Core library for the flotilla test harness.
//!
//! The crate provisions short-lived clusters of virtual machines, talks to
//! them over multiplexed SSH, and drives registered integration tests
//! against them. Every cluster handed to a test is torn down afterwards,
//! whether the test passed, failed, timed out, or panicked.

pub mod backend;
pub mod config;
pub mod fake;
pub mod platform;
pub mod register;
pub mod retry;
pub mod run;
pub mod scaleway;
pub mod ssh;
pub mod suites;
pub mod test_support;

pub use backend::{
    Backend, BackendError, InstanceHandle, InstanceNetworking, InstanceRequest,
    InstanceRequestBuilder,
};
pub use config::{ConfigError, HarnessConfig, ScalewayConfig};
pub use fake::{FakeBackend, FakeBackendError};
pub use platform::{
    BackendCluster, BackendClusterFactory, Cluster, ClusterFactory, ClusterOptions,
    DiscoveryClient, Machine, MachineState, PlatformError,
};
pub use register::{
    PlannedTest, Registry, RegistryError, Selection, TestDescriptor, TestFailure,
};
pub use retry::{RetryPolicy, retry};
pub use run::{RunReport, TestError, TestOutcome, TestResult, TestRunner};
pub use scaleway::{ScalewayBackend, ScalewayBackendError};
pub use ssh::{
    CommandOutput, CommandRunner, ProcessCommandRunner, SshAgent, SshConfig, SshConfigLoadError,
    SshError,
};
