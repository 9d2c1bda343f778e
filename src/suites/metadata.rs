//! Scaleway instance metadata as seen by cloud-init.

use std::sync::Arc;

use super::{require_machines, wait_for_boot};
use crate::platform::Cluster;
use crate::register::{RegistryError, TestDescriptor, TestFailure};
use crate::scaleway;

pub(super) fn descriptor() -> Result<TestDescriptor, RegistryError> {
    TestDescriptor::builder("cloud.metadata.scaleway", run)
        .cluster_size(1)
        .platforms([scaleway::PLATFORM])
        .boot_config("#cloud-config\n")
        .build()
}

async fn run(cluster: Arc<dyn Cluster>) -> Result<(), TestFailure> {
    let machines = require_machines(cluster.as_ref(), 1)?;
    let Some(machine) = machines.first() else {
        return Err(TestFailure::assertion("no machine provisioned"));
    };
    wait_for_boot(machine.as_ref()).await?;

    for (key, expected) in [
        ("v1.cloud_name", scaleway::PLATFORM),
        ("v1.instance_id", machine.id()),
    ] {
        let actual = machine
            .run_command(&format!("cloud-init query {key}"))
            .await?;
        if actual != expected {
            return Err(TestFailure::assertion(format!(
                "{key}: expected {expected:?}, got {actual:?}"
            )));
        }
    }
    Ok(())
}
