//! Kernel NFS server and client between two machines.

use std::sync::Arc;
use std::time::Duration;

use super::{peer_address, wait_for_boot};
use crate::platform::Cluster;
use crate::register::{RegistryError, TestDescriptor, TestFailure};
use crate::retry::retry;

const SERVER_CONFIG: &str = r"#cloud-config
hostname: nfs1
packages:
  - nfs-kernel-server
write_files:
  - path: /etc/exports
    content: |
      /tmp *(ro,insecure,all_squash,no_subtree_check,fsid=0)
runcmd:
  - [exportfs, -ra]
  - [systemctl, restart, nfs-kernel-server]
";

pub(super) fn descriptor() -> Result<TestDescriptor, RegistryError> {
    TestDescriptor::builder("linux.nfs", run).build()
}

fn client_config(server: &str) -> String {
    format!(
        r"#cloud-config
hostname: nfs2
packages:
  - nfs-common
runcmd:
  - [mount, -t, nfs, -o, 'ro,noexec', '{server}:/tmp', /mnt]
"
    )
}

async fn run(cluster: Arc<dyn Cluster>) -> Result<(), TestFailure> {
    let server = cluster.create_machine(SERVER_CONFIG).await?;
    wait_for_boot(server.as_ref()).await?;
    tracing::info!(machine = server.id(), "NFS server booted");

    let exported = server.run_command("mktemp").await?;
    let file_name = exported
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| TestFailure::assertion(format!("mktemp returned {exported:?}")))?
        .to_owned();
    tracing::info!(path = %exported, "test file created on server");

    let client = cluster
        .create_machine(&client_config(peer_address(server.as_ref())))
        .await?;
    wait_for_boot(client.as_ref()).await?;
    tracing::info!(machine = client.id(), "NFS client booted");

    let reader = client.as_ref();
    let listing = retry(5, Duration::from_secs(1), || async move {
        let entries = reader.run_command("ls /mnt").await?;
        if entries.is_empty() {
            return Err(TestFailure::assertion("client /mnt is empty"));
        }
        Ok(entries)
    })
    .await?;

    if !listing.lines().any(|entry| entry == file_name) {
        return Err(TestFailure::assertion(format!(
            "client /mnt did not contain {file_name:?} from server /tmp: {listing}"
        )));
    }
    Ok(())
}
