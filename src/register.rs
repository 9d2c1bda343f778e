//! Registry of integration tests and selection of what to run.
//!
//! Tests are registered explicitly at startup (see
//! [`crate::suites::register_all`]) into a [`Registry`], which keeps them in
//! registration order. A [`Selection`] then resolves command-line names and
//! patterns into a plan for one platform.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::platform::{Cluster, PlatformError};

/// Placeholder in a boot configuration replaced by a fresh discovery
/// endpoint before machines are created.
pub const DISCOVERY_PLACEHOLDER: &str = "$discovery";

/// Future returned by a test entry point.
pub type TestFuture = Pin<Box<dyn Future<Output = Result<(), TestFailure>> + Send + 'static>>;

/// Test entry point. Receives the cluster the runner provisioned for it.
pub type TestEntry = Arc<dyn Fn(Arc<dyn Cluster>) -> TestFuture + Send + Sync>;

/// Failure reported by a test body.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TestFailure {
    /// Raised when an observed value does not match expectations.
    #[error("{0}")]
    Assertion(String),
    /// Raised when a machine or cluster operation fails.
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl TestFailure {
    /// Builds an assertion failure from any displayable message.
    pub fn assertion(message: impl fmt::Display) -> Self {
        Self::Assertion(message.to_string())
    }
}

/// Errors raised while registering or selecting tests.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// Raised when a test with the same name is already registered.
    #[error("test {name} is already registered")]
    DuplicateName {
        /// Conflicting test name.
        name: String,
    },
    /// Raised when a descriptor is malformed.
    #[error("invalid test descriptor: {0}")]
    InvalidDescriptor(String),
    /// Raised when a selection names a test that does not exist.
    #[error("unknown test: {name}")]
    UnknownTest {
        /// Name given in the selection.
        name: String,
    },
}

/// Everything the runner needs to know about one test.
#[derive(Clone)]
pub struct TestDescriptor {
    name: String,
    entry: TestEntry,
    cluster_size: usize,
    platforms: Vec<String>,
    boot_config: String,
    manual: bool,
}

impl TestDescriptor {
    /// Starts a descriptor for the test `name` running `entry`.
    #[must_use]
    pub fn builder<F, Fut>(name: impl Into<String>, entry: F) -> TestDescriptorBuilder
    where
        F: Fn(Arc<dyn Cluster>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
    {
        TestDescriptorBuilder {
            name: name.into(),
            entry: Arc::new(move |cluster: Arc<dyn Cluster>| -> TestFuture {
                Box::pin(entry(cluster))
            }),
            cluster_size: 0,
            platforms: Vec::new(),
            boot_config: String::new(),
            manual: false,
        }
    }

    /// Unique test name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of machines created before the entry point runs.
    #[must_use]
    pub const fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    /// Platforms the test may run on. Empty means every platform.
    #[must_use]
    pub fn platforms(&self) -> &[String] {
        &self.platforms
    }

    /// Boot configuration for the pre-created machines.
    #[must_use]
    pub fn boot_config(&self) -> &str {
        &self.boot_config
    }

    /// Whether the test only runs when selected explicitly.
    #[must_use]
    pub const fn is_manual(&self) -> bool {
        self.manual
    }

    /// Whether the test may run on `platform`.
    #[must_use]
    pub fn supports(&self, platform: &str) -> bool {
        self.platforms.is_empty() || self.platforms.iter().any(|p| p == platform)
    }

    /// Starts the entry point against `cluster`.
    #[must_use]
    pub fn invoke(&self, cluster: Arc<dyn Cluster>) -> TestFuture {
        (self.entry)(cluster)
    }
}

impl fmt::Debug for TestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDescriptor")
            .field("name", &self.name)
            .field("cluster_size", &self.cluster_size)
            .field("platforms", &self.platforms)
            .field("manual", &self.manual)
            .finish_non_exhaustive()
    }
}

/// Builder for [`TestDescriptor`].
pub struct TestDescriptorBuilder {
    name: String,
    entry: TestEntry,
    cluster_size: usize,
    platforms: Vec<String>,
    boot_config: String,
    manual: bool,
}

impl TestDescriptorBuilder {
    /// Sets how many machines to create before the entry point runs.
    #[must_use]
    pub const fn cluster_size(mut self, size: usize) -> Self {
        self.cluster_size = size;
        self
    }

    /// Restricts the test to the given platforms.
    #[must_use]
    pub fn platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.platforms = platforms.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the boot configuration for the pre-created machines.
    #[must_use]
    pub fn boot_config(mut self, payload: impl Into<String>) -> Self {
        self.boot_config = payload.into();
        self
    }

    /// Marks the test as manual.
    #[must_use]
    pub const fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    /// Builds the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidDescriptor`] when the name or a
    /// platform entry is blank.
    pub fn build(self) -> Result<TestDescriptor, RegistryError> {
        let name = self.name.trim().to_owned();
        if name.is_empty() {
            return Err(RegistryError::InvalidDescriptor(String::from(
                "test name must not be empty",
            )));
        }
        if self.platforms.iter().any(|p| p.trim().is_empty()) {
            return Err(RegistryError::InvalidDescriptor(format!(
                "test {name} lists an empty platform"
            )));
        }
        Ok(TestDescriptor {
            name,
            entry: self.entry,
            cluster_size: self.cluster_size,
            platforms: self.platforms,
            boot_config: self.boot_config,
            manual: self.manual,
        })
    }
}

/// Named collection of tests in registration order.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    tests: Vec<TestDescriptor>,
    index: HashMap<String, usize>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateName`] when the name is taken; the
    /// earlier registration is kept.
    pub fn register(&mut self, descriptor: TestDescriptor) -> Result<(), RegistryError> {
        if self.index.contains_key(descriptor.name()) {
            return Err(RegistryError::DuplicateName {
                name: descriptor.name,
            });
        }
        self.index.insert(descriptor.name.clone(), self.tests.len());
        self.tests.push(descriptor);
        Ok(())
    }

    /// Every registered test, in registration order.
    #[must_use]
    pub fn list(&self) -> &[TestDescriptor] {
        &self.tests
    }

    /// Looks a test up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TestDescriptor> {
        self.index.get(name).and_then(|&pos| self.tests.get(pos))
    }

    /// Tests eligible for `platform`. Manual tests are left out unless
    /// `include_manual` is set.
    #[must_use]
    pub fn for_platform(&self, platform: &str, include_manual: bool) -> Vec<&TestDescriptor> {
        self.tests
            .iter()
            .filter(|test| test.supports(platform) && (include_manual || !test.manual))
            .collect()
    }

    /// Number of registered tests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// Whether no tests are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// One entry of a run plan.
#[derive(Clone, Debug)]
pub struct PlannedTest {
    /// Test to run.
    pub descriptor: TestDescriptor,
    /// Reason the test will be reported as skipped instead of run.
    pub skip_reason: Option<String>,
}

/// Which tests to run, as given on the command line.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Selection {
    /// Explicit test names. When non-empty, the pattern is not consulted.
    pub names: Vec<String>,
    /// Glob (`*`, `?`) matched against test names when no names are given.
    pub pattern: Option<String>,
    /// Include manual tests in pattern-based selections.
    pub include_manual: bool,
}

impl Selection {
    /// Resolves the selection against `registry` for `platform`.
    ///
    /// Explicitly named tests always appear in the plan, in the order given;
    /// those that do not support the platform are marked skipped. Manual
    /// tests are included when named.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownTest`] for a name that is not
    /// registered.
    pub fn plan(
        &self,
        registry: &Registry,
        platform: &str,
    ) -> Result<Vec<PlannedTest>, RegistryError> {
        if self.names.is_empty() {
            let pattern = self.pattern.as_deref().unwrap_or("*");
            return Ok(registry
                .for_platform(platform, self.include_manual)
                .into_iter()
                .filter(|test| glob_matches(pattern, test.name()))
                .map(|test| PlannedTest {
                    descriptor: test.clone(),
                    skip_reason: None,
                })
                .collect());
        }

        let mut seen = HashSet::new();
        let mut plan = Vec::with_capacity(self.names.len());
        for name in &self.names {
            if !seen.insert(name.as_str()) {
                continue;
            }
            let test = registry
                .get(name)
                .ok_or_else(|| RegistryError::UnknownTest { name: name.clone() })?;
            let skip_reason = (!test.supports(platform))
                .then(|| format!("not supported on platform {platform}"));
            plan.push(PlannedTest {
                descriptor: test.clone(),
                skip_reason,
            });
        }
        Ok(plan)
    }
}

/// Matches `text` against a glob where `*` spans any run of characters and
/// `?` exactly one.
#[must_use]
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let wanted: Vec<char> = pattern.chars().collect();
    let given: Vec<char> = text.chars().collect();
    let mut p = 0_usize;
    let mut t = 0_usize;
    let mut backtrack: Option<(usize, usize)> = None;

    while t < given.len() {
        match (wanted.get(p), given.get(t)) {
            (Some('*'), _) => {
                backtrack = Some((p, t));
                p += 1;
            }
            (Some(&expected), Some(&actual)) if expected == '?' || expected == actual => {
                p += 1;
                t += 1;
            }
            _ => {
                let Some((star, consumed)) = backtrack else {
                    return false;
                };
                p = star + 1;
                t = consumed + 1;
                backtrack = Some((star, t));
            }
        }
    }
    wanted.get(p..).is_some_and(|rest| rest.iter().all(|&c| c == '*'))
}
