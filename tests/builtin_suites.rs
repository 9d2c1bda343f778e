//! Behavioural tests running the built-in suites on the in-memory platform.

#[path = "common/fleet.rs"]
mod fleet_support;

use fleet_support::Fleet;
use flotilla::fake;
use flotilla::{Registry, Selection, TestOutcome, suites};
use rstest::{fixture, rstest};

#[fixture]
fn registry() -> Registry {
    let mut registry = Registry::new();
    suites::register_all(&mut registry).expect("built-ins register");
    registry
}

#[fixture]
fn fleet() -> Fleet {
    let fleet = Fleet::new();
    fleet.ssh.respond("mktemp", "/tmp/tmp.Qx81fA");
    fleet.ssh.respond("ls /mnt", "tmp.Qx81fA");
    fleet
        .ssh
        .respond("journalctl", "gateway flotilla[812]: supercalifragilisticexpialidocious");
    fleet
}

#[rstest]
#[tokio::test]
async fn eligible_suites_pass_and_leave_no_instances(registry: Registry, fleet: Fleet) {
    let plan = Selection::default()
        .plan(&registry, fake::PLATFORM)
        .expect("plan resolves");

    let report = fleet.runner().with_parallelism(2).run(plan).await;

    let names: Vec<&str> = report.results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["systemd.journal.remote", "linux.nfs"]);
    assert!(
        report
            .results
            .iter()
            .all(|r| r.outcome == TestOutcome::Passed),
        "{:?}",
        report.results
    );
    assert_eq!(report.exit_code(), 0);
    assert_eq!(fleet.backend.created(), 4);
    assert_eq!(fleet.backend.live_instances(), 0);
}

#[rstest]
#[tokio::test]
async fn nfs_client_mounts_the_server_private_address(registry: Registry, fleet: Fleet) {
    let selection = Selection {
        names: vec![String::from("linux.nfs")],
        ..Selection::default()
    };
    let plan = selection
        .plan(&registry, fake::PLATFORM)
        .expect("plan resolves");

    let report = fleet.runner().run(plan).await;

    assert_eq!(report.passed(), 1, "{:?}", report.results);
    let configs: Vec<String> = fleet
        .backend
        .instances()
        .into_iter()
        .filter_map(|instance| instance.boot_config)
        .collect();
    assert!(
        configs
            .iter()
            .any(|config| config.contains("'10.0.0.1:/tmp'")),
        "{configs:?}"
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn missing_journal_entry_fails_the_test(registry: Registry) {
    let fleet = Fleet::new();
    let selection = Selection {
        names: vec![String::from("systemd.journal.remote")],
        ..Selection::default()
    };
    let plan = selection
        .plan(&registry, fake::PLATFORM)
        .expect("plan resolves");

    let report = fleet.runner().run(plan).await;

    assert_eq!(report.failed(), 1);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(fleet.backend.live_instances(), 0);
}

#[rstest]
#[tokio::test]
async fn platform_specific_suite_is_skipped_elsewhere(registry: Registry, fleet: Fleet) {
    let selection = Selection {
        names: vec![String::from("cloud.metadata.scaleway")],
        ..Selection::default()
    };
    let plan = selection
        .plan(&registry, fake::PLATFORM)
        .expect("plan resolves");

    let report = fleet.runner().run(plan).await;

    assert_eq!(report.skipped(), 1);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(fleet.backend.created(), 0);
}
