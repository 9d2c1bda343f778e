//! Built-in integration tests.
//!
//! Each submodule contributes one test. [`register_all`] adds every one of
//! them to a registry; nothing registers itself implicitly.

use std::sync::Arc;

use crate::platform::{Cluster, Machine};
use crate::register::{Registry, RegistryError, TestFailure};

mod discovery;
mod journald;
mod metadata;
mod nfs;

/// Blocks until cloud-init has finished applying the boot configuration.
const WAIT_FOR_BOOT: &str = "sudo cloud-init status --wait";

/// Registers every built-in test.
///
/// # Errors
///
/// Returns [`RegistryError`] when a built-in name is already taken.
pub fn register_all(registry: &mut Registry) -> Result<(), RegistryError> {
    for descriptor in [
        journald::descriptor()?,
        nfs::descriptor()?,
        metadata::descriptor()?,
        discovery::descriptor()?,
    ] {
        registry.register(descriptor)?;
    }
    Ok(())
}

/// Waits for the machine's first boot to complete.
async fn wait_for_boot(machine: &dyn Machine) -> Result<(), TestFailure> {
    machine.run_command(WAIT_FOR_BOOT).await?;
    Ok(())
}

/// Address other machines in the cluster should use to reach `machine`.
fn peer_address(machine: &dyn Machine) -> &str {
    if machine.private_ip().is_empty() {
        machine.public_ip()
    } else {
        machine.private_ip()
    }
}

/// Machines the runner created for the test, failing when there are fewer
/// than `count`.
fn require_machines(
    cluster: &dyn Cluster,
    count: usize,
) -> Result<Vec<Arc<dyn Machine>>, TestFailure> {
    let mut machines = cluster.list_machines();
    if machines.len() < count {
        return Err(TestFailure::assertion(format!(
            "expected {count} machine(s), cluster has {}",
            machines.len()
        )));
    }
    machines.sort_by(|lhs, rhs| lhs.id().cmp(rhs.id()));
    Ok(machines)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fake::FakeBackend;
    use crate::platform::{BackendClusterFactory, ClusterFactory, ClusterOptions};
    use crate::retry::RetryPolicy;
    use crate::test_support::{FakeSshRunner, ssh_config};

    #[test]
    fn builtin_suites_register_once() {
        let mut registry = Registry::new();

        register_all(&mut registry).expect("built-ins register");

        let names: Vec<&str> = registry.list().iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            [
                "systemd.journal.remote",
                "linux.nfs",
                "cloud.metadata.scaleway",
                "cluster.discovery"
            ]
        );
        assert!(matches!(
            register_all(&mut registry),
            Err(RegistryError::DuplicateName { .. })
        ));
    }

    #[test]
    fn manual_and_platform_constraints_hold() {
        let mut registry = Registry::new();
        register_all(&mut registry).expect("built-ins register");

        let fake: Vec<&str> = registry
            .for_platform("fake", false)
            .into_iter()
            .map(|t| t.name())
            .collect();

        assert_eq!(fake, ["systemd.journal.remote", "linux.nfs"]);
        assert!(
            registry
                .get("cluster.discovery")
                .is_some_and(|t| t.is_manual() && t.boot_config().contains("$discovery"))
        );
    }

    #[tokio::test]
    async fn machines_are_ordered_and_counted() {
        let factory = BackendClusterFactory::new(
            "fake",
            FakeBackend::new(),
            FakeSshRunner::new(),
            ssh_config(),
        )
        .with_options(ClusterOptions {
            readiness: RetryPolicy::new(1, Duration::ZERO),
            provision_timeout: Duration::from_secs(5),
        });
        let cluster = factory.new_cluster().expect("cluster");
        cluster.create_machine("").await.expect("first");
        cluster.create_machine("").await.expect("second");

        let machines = require_machines(cluster.as_ref(), 2).expect("two machines");
        let err = require_machines(cluster.as_ref(), 3).expect_err("only two");

        let ids: Vec<&str> = machines.iter().map(|m| m.id()).collect();
        assert_eq!(ids, ["fake-1", "fake-2"]);
        assert_eq!(
            err,
            TestFailure::Assertion(String::from("expected 3 machine(s), cluster has 2"))
        );
        assert_eq!(machines.first().map(|m| peer_address(m.as_ref())), Some("10.0.0.1"));
        cluster.destroy_all().await.expect("teardown");
    }
}
