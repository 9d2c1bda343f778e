//! Unit tests for the test runner over the in-memory backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rstest::{fixture, rstest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use super::*;
use crate::fake::{self, FakeBackend};
use crate::platform::{BackendClusterFactory, ClusterOptions, DiscoveryClient};
use crate::register::{Registry, Selection, TestDescriptorBuilder};
use crate::retry::RetryPolicy;
use crate::test_support::{FakeSshRunner, ssh_config};

struct Fleet {
    backend: FakeBackend,
    ssh: FakeSshRunner,
}

impl Fleet {
    fn factory(&self) -> BackendClusterFactory<FakeBackend, FakeSshRunner> {
        BackendClusterFactory::new(
            fake::PLATFORM,
            self.backend.clone(),
            self.ssh.clone(),
            ssh_config(),
        )
        .with_options(ClusterOptions {
            readiness: RetryPolicy::new(2, Duration::from_millis(1)),
            provision_timeout: Duration::from_secs(5),
        })
    }

    fn runner(&self) -> TestRunner {
        TestRunner::new(Arc::new(self.factory()))
    }
}

#[fixture]
fn fleet() -> Fleet {
    Fleet {
        backend: FakeBackend::new(),
        ssh: FakeSshRunner::new(),
    }
}

fn planned(builders: Vec<TestDescriptorBuilder>) -> Vec<PlannedTest> {
    builders
        .into_iter()
        .map(|builder| PlannedTest {
            descriptor: builder.build().expect("descriptor"),
            skip_reason: None,
        })
        .collect()
}

fn outcomes(report: &RunReport) -> Vec<(&str, &TestOutcome)> {
    report
        .results
        .iter()
        .map(|result| (result.name.as_str(), &result.outcome))
        .collect()
}

async fn passes(_cluster: Arc<dyn Cluster>) -> Result<(), TestFailure> {
    Ok(())
}

async fn two_machines_answer(cluster: Arc<dyn Cluster>) -> Result<(), TestFailure> {
    let machines = cluster.list_machines();
    if machines.len() != 2 {
        return Err(TestFailure::assertion(format!(
            "expected 2 machines, found {}",
            machines.len()
        )));
    }
    for machine in machines {
        let name = machine.run_command("hostname").await?;
        if name != "node" {
            return Err(TestFailure::assertion(format!("unexpected hostname {name}")));
        }
    }
    Ok(())
}

async fn panics_after_three_machines(cluster: Arc<dyn Cluster>) -> Result<(), TestFailure> {
    for _ in 0..3 {
        cluster.create_machine("").await?;
    }
    panic!("boom");
}

async fn never_finishes(cluster: Arc<dyn Cluster>) -> Result<(), TestFailure> {
    cluster.create_machine("").await?;
    sleep(Duration::from_secs(3600)).await;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn cluster_of_two_passes_and_leaves_no_resources(fleet: Fleet) {
    fleet.ssh.respond("hostname", "node");
    let mut registry = Registry::new();
    registry
        .register(
            TestDescriptor::builder("pair", two_machines_answer)
                .cluster_size(2)
                .platforms([fake::PLATFORM])
                .build()
                .expect("descriptor"),
        )
        .expect("registers");
    let plan = Selection::default()
        .plan(&registry, fake::PLATFORM)
        .expect("plan resolves");

    let report = fleet.runner().run(plan).await;

    assert_eq!(outcomes(&report), vec![("pair", &TestOutcome::Passed)]);
    assert_eq!(fleet.backend.created(), 2);
    assert_eq!(fleet.backend.live_instances(), 0);
    assert_eq!(report.exit_code(), 0);
}

#[rstest]
#[tokio::test]
async fn panicking_test_is_contained_and_cleaned_up(fleet: Fleet) {
    let plan = planned(vec![
        TestDescriptor::builder("panics", panics_after_three_machines),
        TestDescriptor::builder("follows", passes).cluster_size(1),
    ]);

    let report = fleet.runner().run(plan).await;

    assert_eq!(
        outcomes(&report),
        vec![
            (
                "panics",
                &TestOutcome::Failed(TestError::AbnormalTermination(String::from("boom")))
            ),
            ("follows", &TestOutcome::Passed),
        ]
    );
    assert_eq!(fleet.backend.created(), 4);
    assert_eq!(fleet.backend.live_instances(), 0);
    assert_eq!(report.exit_code(), 1);
}

#[rstest]
#[tokio::test]
async fn failing_body_is_reported_with_its_message(fleet: Fleet) {
    let plan = planned(vec![TestDescriptor::builder(
        "fails",
        |_cluster: Arc<dyn Cluster>| async {
            Err::<(), _>(TestFailure::assertion("nope"))
        },
    )]);

    let report = fleet.runner().run(plan).await;

    assert_eq!(
        outcomes(&report),
        vec![(
            "fails",
            &TestOutcome::Failed(TestError::Failure(TestFailure::Assertion(String::from(
                "nope"
            ))))
        )]
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn slow_test_times_out_and_is_torn_down(fleet: Fleet) {
    let plan = planned(vec![TestDescriptor::builder("slow", never_finishes)]);

    let report = fleet
        .runner()
        .with_test_timeout(Duration::from_secs(1))
        .run(plan)
        .await;

    assert_eq!(outcomes(&report), vec![("slow", &TestOutcome::TimedOut)]);
    assert_eq!(fleet.backend.created(), 1);
    assert_eq!(fleet.backend.live_instances(), 0);
    assert_eq!(report.exit_code(), 1);
}

#[rstest]
#[tokio::test]
async fn provisioning_failure_is_a_setup_error(fleet: Fleet) {
    fleet.backend.fail_next_creates(1);
    let plan = planned(vec![TestDescriptor::builder("needs-one", passes).cluster_size(1)]);

    let report = fleet.runner().run(plan).await;

    let Some(TestOutcome::Failed(TestError::Setup(message))) =
        report.results.first().map(|r| &r.outcome)
    else {
        panic!("expected setup failure, got {report:?}");
    };
    assert!(message.contains("rejected"), "{message}");
    assert_eq!(report.exit_code(), 2);
    assert_eq!(fleet.backend.live_instances(), 0);
}

#[rstest]
#[tokio::test]
async fn teardown_failure_fails_a_passing_test(fleet: Fleet) {
    fleet.backend.fail_next_destroys(1);
    let plan = planned(vec![TestDescriptor::builder("leaky", passes).cluster_size(1)]);

    let report = fleet.runner().run(plan).await;

    let result = report.results.first().expect("one result");
    assert!(
        matches!(result.outcome, TestOutcome::Failed(TestError::Teardown(_))),
        "{result:?}"
    );
    assert!(result.teardown_error.is_some());
    assert_eq!(fleet.backend.live_instances(), 1);
}

#[rstest]
#[tokio::test]
async fn planned_skips_are_reported_without_provisioning(fleet: Fleet) {
    let plan = vec![PlannedTest {
        descriptor: TestDescriptor::builder("elsewhere", passes)
            .cluster_size(1)
            .build()
            .expect("descriptor"),
        skip_reason: Some(String::from("not supported on platform fake")),
    }];

    let report = fleet.runner().run(plan).await;

    assert_eq!(
        outcomes(&report),
        vec![(
            "elsewhere",
            &TestOutcome::Skipped(String::from("not supported on platform fake"))
        )]
    );
    assert_eq!(fleet.backend.created(), 0);
    assert_eq!(report.exit_code(), 0);
}

#[rstest]
#[tokio::test]
async fn cancelled_run_skips_unstarted_tests(fleet: Fleet) {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let plan = planned(vec![
        TestDescriptor::builder("a", passes).cluster_size(1),
        TestDescriptor::builder("b", passes),
    ]);

    let report = fleet.runner().with_cancellation(cancel).run(plan).await;

    assert!(
        report
            .results
            .iter()
            .all(|r| r.outcome == TestOutcome::Skipped(String::from("interrupted"))),
        "{report:?}"
    );
    assert_eq!(fleet.backend.created(), 0);
}

#[rstest]
#[tokio::test]
async fn interrupt_aborts_running_test_and_tears_down(fleet: Fleet) {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let plan = planned(vec![TestDescriptor::builder(
        "interrupted",
        move |cluster: Arc<dyn Cluster>| {
            let token = trigger.clone();
            async move {
                cluster.create_machine("").await?;
                token.cancel();
                sleep(Duration::from_secs(3600)).await;
                Ok::<(), TestFailure>(())
            }
        },
    )]);

    let report = fleet.runner().with_cancellation(cancel).run(plan).await;

    assert_eq!(
        outcomes(&report),
        vec![("interrupted", &TestOutcome::Failed(TestError::Interrupted))]
    );
    assert_eq!(fleet.backend.live_instances(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn interrupt_during_slow_create_leaves_no_instances(fleet: Fleet) {
    fleet.backend.delay_creates(Duration::from_secs(30));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });
    let plan = planned(vec![TestDescriptor::builder("stalled", passes).cluster_size(1)]);

    let report = fleet.runner().with_cancellation(cancel).run(plan).await;

    assert_eq!(
        outcomes(&report),
        vec![("stalled", &TestOutcome::Failed(TestError::Interrupted))]
    );
    assert_eq!(fleet.backend.created(), 1);
    assert_eq!(fleet.backend.live_instances(), 0);
}

#[rstest]
#[tokio::test]
async fn parallelism_bounds_concurrent_tests(fleet: Fleet) {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let builders = (0..4)
        .map(|n| {
            let running = Arc::clone(&active);
            let highest = Arc::clone(&peak);
            TestDescriptor::builder(format!("t{n}"), move |_cluster: Arc<dyn Cluster>| {
                let current = Arc::clone(&running);
                let max = Arc::clone(&highest);
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), TestFailure>(())
                }
            })
        })
        .collect();

    let report = fleet
        .runner()
        .with_parallelism(2)
        .run(planned(builders))
        .await;

    assert_eq!(report.passed(), 4);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    let names: Vec<&str> = report.results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["t0", "t1", "t2", "t3"]);
}

#[rstest]
#[tokio::test]
async fn discovery_placeholder_is_resolved_before_provisioning(fleet: Fleet) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("address");
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buf = [0_u8; 1024];
        let read = socket.read(&mut buf).await.expect("read");
        let body = "https://discovery.test/abc123";
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket
            .write_all(response.as_bytes())
            .await
            .expect("write");
        String::from_utf8_lossy(buf.get(..read).unwrap_or_default()).into_owned()
    });
    let factory = fleet
        .factory()
        .with_discovery(DiscoveryClient::new(format!("http://{addr}")));
    let plan = planned(vec![
        TestDescriptor::builder("discovers", passes)
            .cluster_size(2)
            .boot_config("etcd:\n  discovery: $discovery\n"),
    ]);

    let report = TestRunner::new(Arc::new(factory)).run(plan).await;

    assert_eq!(report.passed(), 1, "{report:?}");
    let request = server.await.expect("server task");
    assert!(request.starts_with("GET /new?size=2 "), "{request}");
    assert_eq!(fleet.backend.created(), 2);
    assert_eq!(fleet.backend.live_instances(), 0);
}

fn result(name: &str, outcome: TestOutcome) -> TestResult {
    TestResult {
        name: name.to_owned(),
        outcome,
        duration: Duration::from_millis(1500),
        teardown_error: None,
    }
}

#[rstest]
#[case(vec![], 0)]
#[case(vec![TestOutcome::Passed, TestOutcome::Skipped(String::from("x"))], 0)]
#[case(vec![TestOutcome::Passed, TestOutcome::TimedOut], 1)]
#[case(vec![TestOutcome::Failed(TestError::Setup(String::from("x"))), TestOutcome::Passed], 1)]
#[case(vec![TestOutcome::Failed(TestError::Setup(String::from("x")))], 2)]
#[case(vec![TestOutcome::Skipped(String::from("x"))], 0)]
fn exit_code_reflects_outcomes(#[case] outcomes: Vec<TestOutcome>, #[case] expected: i32) {
    let report = RunReport {
        results: outcomes
            .into_iter()
            .map(|outcome| result("t", outcome))
            .collect(),
    };

    assert_eq!(report.exit_code(), expected);
}

#[test]
fn render_lists_each_test_and_a_summary() {
    let report = RunReport {
        results: vec![
            result("linux.nfs", TestOutcome::Passed),
            result(
                "systemd.journal.remote",
                TestOutcome::Failed(TestError::Interrupted),
            ),
            result(
                "cloud.metadata.scaleway",
                TestOutcome::Skipped(String::from("not supported on platform fake")),
            ),
        ],
    };
    let mut buf = Vec::new();

    report.render(&mut buf).expect("render");

    let rendered = String::from_utf8(buf).expect("utf8");
    assert_eq!(
        rendered,
        concat!(
            "--- PASS: linux.nfs (1.500s)\n",
            "--- FAIL: systemd.journal.remote (1.500s)\n",
            "        test interrupted\n",
            "--- SKIP: cloud.metadata.scaleway (not supported on platform fake)\n",
            "1 passed, 1 failed, 1 skipped\n",
        )
    );
}
