//! In-memory fleet shared by integration tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file
//! in `tests/`). Include this module with:
//!
//! ```rust
//! #[path = "common/fleet.rs"]
//! mod fleet;
//! ```

use std::sync::Arc;
use std::time::Duration;

use flotilla::fake::{self, FakeBackend};
use flotilla::test_support::{FakeSshRunner, ssh_config};
use flotilla::{BackendClusterFactory, ClusterOptions, RetryPolicy, TestRunner};

/// Fake backend and SSH hosts wired into a cluster factory.
pub struct Fleet {
    /// Backend that records every instance created and destroyed.
    pub backend: FakeBackend,
    /// SSH runner answering for every fake host.
    pub ssh: FakeSshRunner,
}

impl Fleet {
    /// Creates a fleet where every host is reachable.
    pub fn new() -> Self {
        Self {
            backend: FakeBackend::new(),
            ssh: FakeSshRunner::new(),
        }
    }

    /// Test runner provisioning clusters from this fleet.
    pub fn runner(&self) -> TestRunner {
        let factory = BackendClusterFactory::new(
            fake::PLATFORM,
            self.backend.clone(),
            self.ssh.clone(),
            ssh_config(),
        )
        .with_options(ClusterOptions {
            readiness: RetryPolicy::new(2, Duration::from_millis(1)),
            provision_timeout: Duration::from_secs(5),
        });
        TestRunner::new(Arc::new(factory))
    }
}
