//! systemd-journal-remote pulling entries from a systemd-journal-gatewayd
//! server.

use std::sync::Arc;
use std::time::Duration;

use shell_escape::unix::escape;

use super::{peer_address, wait_for_boot};
use crate::platform::Cluster;
use crate::register::{RegistryError, TestDescriptor, TestFailure};
use crate::retry::retry;

const GATEWAY_HOSTNAME: &str = "gateway";
const GATEWAY_PORT: u16 = 19531;
const MESSAGE: &str = "supercalifragilisticexpialidocious";
const TAG: &str = "flotilla";

const GATEWAY_CONFIG: &str = r"#cloud-config
hostname: gateway
packages:
  - systemd-journal-remote
runcmd:
  - [systemctl, enable, --now, systemd-journal-gatewayd.socket]
";

const COLLECTOR_CONFIG: &str = r"#cloud-config
packages:
  - systemd-journal-remote
";

pub(super) fn descriptor() -> Result<TestDescriptor, RegistryError> {
    TestDescriptor::builder("systemd.journal.remote", run).build()
}

async fn run(cluster: Arc<dyn Cluster>) -> Result<(), TestFailure> {
    let gateway = cluster.create_machine(GATEWAY_CONFIG).await?;
    wait_for_boot(gateway.as_ref()).await?;
    gateway
        .run_command(&format!("logger -t {TAG} {}", escape(MESSAGE.into())))
        .await?;

    let collector = cluster.create_machine(COLLECTOR_CONFIG).await?;
    wait_for_boot(collector.as_ref()).await?;

    let source = peer_address(gateway.as_ref());
    collector
        .run_command(&format!(
            "sudo systemd-run --unit systemd-journal-remote-client \
             /usr/lib/systemd/systemd-journal-remote --url http://{source}:{GATEWAY_PORT}"
        ))
        .await?;

    let read_journal = format!(
        "sudo journalctl _HOSTNAME={GATEWAY_HOSTNAME} -t {TAG} \
         --file /var/log/journal/remote/remote-{source}:{GATEWAY_PORT}.journal"
    );
    let reader = collector.as_ref();
    let command = read_journal.as_str();
    retry(5, Duration::from_secs(2), || async move {
        let entries = reader.run_command(command).await?;
        if entries.contains(MESSAGE) {
            Ok(())
        } else {
            Err(TestFailure::assertion(format!(
                "journal missing entry: expected {MESSAGE:?}, got {entries:?}"
            )))
        }
    })
    .await
}
