//! Three-member etcd cluster bootstrapped through a discovery endpoint.
//!
//! Manual: it depends on the public discovery service being reachable.

use std::sync::Arc;
use std::time::Duration;

use super::{require_machines, wait_for_boot};
use crate::platform::Cluster;
use crate::register::{RegistryError, TestDescriptor, TestFailure};
use crate::retry::retry;

const MEMBERS: usize = 3;

const BOOT_CONFIG: &str = r#"#cloud-config
packages:
  - etcd-server
  - etcd-client
runcmd:
  - systemctl stop etcd
  - rm -rf /var/lib/etcd/default
  - |
    ip=$(hostname -I | cut -d' ' -f1)
    cat > /etc/default/etcd <<EOF
    ETCD_NAME=$(hostname)
    ETCD_DATA_DIR=/var/lib/etcd/default
    ETCD_DISCOVERY=$discovery
    ETCD_LISTEN_PEER_URLS=http://$ip:2380
    ETCD_LISTEN_CLIENT_URLS=http://$ip:2379,http://127.0.0.1:2379
    ETCD_INITIAL_ADVERTISE_PEER_URLS=http://$ip:2380
    ETCD_ADVERTISE_CLIENT_URLS=http://$ip:2379
    EOF
  - systemctl start --no-block etcd
"#;

pub(super) fn descriptor() -> Result<TestDescriptor, RegistryError> {
    TestDescriptor::builder("cluster.discovery", run)
        .cluster_size(MEMBERS)
        .boot_config(BOOT_CONFIG)
        .manual()
        .build()
}

async fn run(cluster: Arc<dyn Cluster>) -> Result<(), TestFailure> {
    let machines = require_machines(cluster.as_ref(), MEMBERS)?;
    for machine in &machines {
        wait_for_boot(machine.as_ref()).await?;
    }

    for machine in &machines {
        let member = machine.as_ref();
        retry(10, Duration::from_secs(5), || async move {
            let listing = member.run_command("etcdctl member list").await?;
            let count = listing.lines().filter(|line| !line.trim().is_empty()).count();
            if count == MEMBERS {
                Ok(())
            } else {
                Err(TestFailure::assertion(format!(
                    "{} sees {count} member(s), expected {MEMBERS}",
                    member.id()
                )))
            }
        })
        .await?;
    }

    let (Some(writer), Some(reader)) = (machines.first(), machines.last()) else {
        return Err(TestFailure::assertion("no machines provisioned"));
    };
    writer
        .run_command("etcdctl put flotilla/marker discovered")
        .await?;
    let value = reader
        .run_command("etcdctl get --print-value-only flotilla/marker")
        .await?;
    if value != "discovered" {
        return Err(TestFailure::assertion(format!(
            "{} read {value:?} for a key written on {}",
            reader.id(),
            writer.id()
        )));
    }
    Ok(())
}
