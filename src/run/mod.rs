//! Executes selected tests against freshly provisioned clusters.
//!
//! Every planned test runs in its own task with its own cluster, bounded by
//! a semaphore. The test body runs in a further task so a panic, a timeout
//! or an interrupt is observed without tearing the runner down, and the
//! cluster is destroyed afterwards whatever the outcome. Results come back
//! in plan order.

use std::any::Any;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::platform::{Cluster, ClusterFactory, PlatformError};
use crate::register::{DISCOVERY_PLACEHOLDER, PlannedTest, TestDescriptor, TestFailure};

const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const INTERRUPTED: &str = "interrupted";

/// Why a test did not pass.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TestError {
    /// Raised when the cluster or its machines could not be provisioned.
    #[error("setup failed: {0}")]
    Setup(String),
    /// Raised when the test body reports a failure.
    #[error("{0}")]
    Failure(TestFailure),
    /// Raised when the test body panics or its task is lost.
    #[error("test terminated abnormally: {0}")]
    AbnormalTermination(String),
    /// Raised when the run is interrupted while the test is running.
    #[error("test interrupted")]
    Interrupted,
    /// Raised when the test passed but its cluster could not be destroyed.
    #[error("teardown failed: {0}")]
    Teardown(String),
}

/// Final state of one test.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TestOutcome {
    /// The body returned success.
    Passed,
    /// The test failed for the given reason.
    Failed(TestError),
    /// The body exceeded the test timeout.
    TimedOut,
    /// The test was not run, with the reason why.
    Skipped(String),
}

impl TestOutcome {
    const fn label(&self) -> &'static str {
        match self {
            Self::Passed => "PASS",
            Self::Failed(_) | Self::TimedOut => "FAIL",
            Self::Skipped(_) => "SKIP",
        }
    }
}

/// Outcome of one test with its timing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestResult {
    /// Test name.
    pub name: String,
    /// What happened.
    pub outcome: TestOutcome,
    /// Wall-clock time from cluster creation to teardown.
    pub duration: Duration,
    /// Teardown failure, when one occurred.
    pub teardown_error: Option<String>,
}

impl TestResult {
    fn skipped(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_owned(),
            outcome: TestOutcome::Skipped(reason.into()),
            duration: Duration::ZERO,
            teardown_error: None,
        }
    }
}

/// Results of a whole run, in plan order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunReport {
    /// One entry per planned test.
    pub results: Vec<TestResult>,
}

impl RunReport {
    /// Number of passed tests.
    #[must_use]
    pub fn passed(&self) -> usize {
        self.count(|outcome| matches!(outcome, TestOutcome::Passed))
    }

    /// Number of failed or timed out tests.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, TestOutcome::Failed(_) | TestOutcome::TimedOut))
    }

    /// Number of skipped tests.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, TestOutcome::Skipped(_)))
    }

    /// Process exit status for the run: `0` when nothing failed, `1` when a
    /// test failed or timed out, and `2` when tests were attempted but every
    /// one of them failed during setup.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        let attempted: Vec<&TestOutcome> = self
            .results
            .iter()
            .map(|result| &result.outcome)
            .filter(|outcome| !matches!(outcome, TestOutcome::Skipped(_)))
            .collect();
        if !attempted.is_empty()
            && attempted
                .iter()
                .all(|outcome| matches!(outcome, TestOutcome::Failed(TestError::Setup(_))))
        {
            return 2;
        }
        i32::from(self.failed() > 0)
    }

    /// Writes one line per test followed by a summary.
    ///
    /// # Errors
    ///
    /// Returns any error raised by `out`.
    pub fn render(&self, mut out: impl Write) -> io::Result<()> {
        for result in &self.results {
            match &result.outcome {
                TestOutcome::Skipped(reason) => {
                    writeln!(out, "--- SKIP: {} ({reason})", result.name)?;
                }
                outcome => {
                    writeln!(
                        out,
                        "--- {}: {} ({:.3}s)",
                        outcome.label(),
                        result.name,
                        result.duration.as_secs_f64()
                    )?;
                    match outcome {
                        TestOutcome::Failed(err) => writeln!(out, "        {err}")?,
                        TestOutcome::TimedOut => writeln!(out, "        test timed out")?,
                        TestOutcome::Passed | TestOutcome::Skipped(_) => {}
                    }
                }
            }
            if let Some(teardown) = &result.teardown_error
                && !matches!(result.outcome, TestOutcome::Failed(TestError::Teardown(_)))
            {
                writeln!(out, "        teardown: {teardown}")?;
            }
        }
        writeln!(
            out,
            "{} passed, {} failed, {} skipped",
            self.passed(),
            self.failed(),
            self.skipped()
        )
    }

    fn count(&self, predicate: impl Fn(&TestOutcome) -> bool) -> usize {
        self.results
            .iter()
            .filter(|result| predicate(&result.outcome))
            .count()
    }
}

/// Runs planned tests on clusters from one factory.
pub struct TestRunner {
    factory: Arc<dyn ClusterFactory>,
    parallelism: usize,
    test_timeout: Duration,
    cancel: CancellationToken,
}

struct RunContext {
    factory: Arc<dyn ClusterFactory>,
    test_timeout: Duration,
    cancel: CancellationToken,
    permits: Semaphore,
}

impl TestRunner {
    /// Creates a runner that executes one test at a time.
    #[must_use]
    pub fn new(factory: Arc<dyn ClusterFactory>) -> Self {
        Self {
            factory,
            parallelism: 1,
            test_timeout: DEFAULT_TEST_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets how many tests, and therefore clusters, may be active at once.
    /// Values below one are raised to one.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the deadline for each test body.
    #[must_use]
    pub const fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    /// Shares `cancel` with the runner. Cancelling it skips tests that have
    /// not started and interrupts running ones; clusters are still torn
    /// down.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs every planned test and returns their results in plan order.
    pub async fn run(&self, plan: Vec<PlannedTest>) -> RunReport {
        let context = Arc::new(RunContext {
            factory: Arc::clone(&self.factory),
            test_timeout: self.test_timeout,
            cancel: self.cancel.clone(),
            permits: Semaphore::new(self.parallelism),
        });
        tracing::info!(
            platform = self.factory.platform(),
            tests = plan.len(),
            parallelism = self.parallelism,
            "starting test run"
        );

        let tasks: Vec<(String, tokio::task::JoinHandle<TestResult>)> = plan
            .into_iter()
            .map(|planned| {
                let name = planned.descriptor.name().to_owned();
                let task = tokio::spawn(Arc::clone(&context).run_planned(planned));
                (name, task)
            })
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        for (name, task) in tasks {
            let result = task.await.unwrap_or_else(|err| TestResult {
                outcome: TestOutcome::Failed(TestError::AbnormalTermination(join_message(err))),
                duration: Duration::ZERO,
                teardown_error: None,
                name,
            });
            results.push(result);
        }
        RunReport { results }
    }
}

impl RunContext {
    async fn run_planned(self: Arc<Self>, planned: PlannedTest) -> TestResult {
        let test = planned.descriptor;
        if let Some(reason) = planned.skip_reason {
            return TestResult::skipped(test.name(), reason);
        }

        let permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            permit = self.permits.acquire() => permit.ok(),
        };
        let Some(_permit) = permit else {
            return TestResult::skipped(test.name(), INTERRUPTED);
        };
        if self.cancel.is_cancelled() {
            return TestResult::skipped(test.name(), INTERRUPTED);
        }

        tracing::info!(test = test.name(), "starting test");
        let started = Instant::now();
        let cluster = match self.factory.new_cluster() {
            Ok(cluster) => cluster,
            Err(err) => {
                return self.finish(
                    &test,
                    started,
                    TestOutcome::Failed(TestError::Setup(err.to_string())),
                    None,
                );
            }
        };

        let body_outcome = self.execute(&test, &cluster).await;
        let teardown_error = cluster.destroy_all().await.err().map(|err| err.to_string());
        let outcome = match (body_outcome, &teardown_error) {
            (TestOutcome::Passed, Some(err)) => TestOutcome::Failed(TestError::Teardown(err.clone())),
            (other, _) => other,
        };
        self.finish(&test, started, outcome, teardown_error)
    }

    async fn execute(&self, test: &TestDescriptor, cluster: &Arc<dyn Cluster>) -> TestOutcome {
        let prepared = tokio::select! {
            result = prepare(test, cluster.as_ref()) => result,
            () = self.cancel.cancelled() => return TestOutcome::Failed(TestError::Interrupted),
        };
        if let Err(err) = prepared {
            return TestOutcome::Failed(TestError::Setup(err.to_string()));
        }

        let body = test.clone();
        let body_cluster = Arc::clone(cluster);
        let mut task = tokio::spawn(async move { body.invoke(body_cluster).await });
        let outcome = tokio::select! {
            joined = &mut task => return classify(joined),
            () = sleep(self.test_timeout) => TestOutcome::TimedOut,
            () = self.cancel.cancelled() => TestOutcome::Failed(TestError::Interrupted),
        };

        task.abort();
        if let Err(err) = task.await
            && err.is_panic()
        {
            tracing::warn!(test = test.name(), "test panicked while being aborted");
        }
        outcome
    }

    fn finish(
        &self,
        test: &TestDescriptor,
        started: Instant,
        outcome: TestOutcome,
        teardown_error: Option<String>,
    ) -> TestResult {
        let duration = started.elapsed();
        match &outcome {
            TestOutcome::Passed => {
                tracing::info!(test = test.name(), ?duration, "test passed");
            }
            other => {
                tracing::warn!(
                    test = test.name(),
                    ?duration,
                    outcome = ?other,
                    timeout = ?self.test_timeout,
                    "test did not pass"
                );
            }
        }
        TestResult {
            name: test.name().to_owned(),
            outcome,
            duration,
            teardown_error,
        }
    }
}

/// Creates the machines a test asks for, resolving the discovery
/// placeholder first.
async fn prepare(test: &TestDescriptor, cluster: &dyn Cluster) -> Result<(), PlatformError> {
    let size = test.cluster_size();
    if size == 0 {
        return Ok(());
    }

    let boot_config = if test.boot_config().contains(DISCOVERY_PLACEHOLDER) {
        let endpoint = cluster.discovery_endpoint(size).await?;
        tracing::debug!(test = test.name(), %endpoint, "resolved discovery endpoint");
        test.boot_config().replace(DISCOVERY_PLACEHOLDER, &endpoint)
    } else {
        test.boot_config().to_owned()
    };

    for _ in 0..size {
        cluster.create_machine(&boot_config).await?;
    }
    Ok(())
}

fn classify(joined: Result<Result<(), TestFailure>, JoinError>) -> TestOutcome {
    match joined {
        Ok(Ok(())) => TestOutcome::Passed,
        Ok(Err(failure)) => TestOutcome::Failed(TestError::Failure(failure)),
        Err(err) => TestOutcome::Failed(TestError::AbnormalTermination(join_message(err))),
    }
}

fn join_message(err: JoinError) -> String {
    if err.is_panic() {
        let payload = err.into_panic();
        panic_message(payload.as_ref())
    } else {
        err.to_string()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("panic with a non-string payload"))
}

#[cfg(test)]
mod tests;
