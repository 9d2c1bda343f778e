//! Binary entry point for the flotilla CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use flotilla::{
    BackendClusterFactory, ClusterFactory, DiscoveryClient, HarnessConfig, ProcessCommandRunner,
    Registry, RegistryError, ScalewayBackend, ScalewayConfig, Selection, SshConfig, TestRunner,
    scaleway, suites,
};

mod cli;

use cli::{Cli, ListCommand, RunCommand};

/// Platforms the binary can provision on.
const KNOWN_PLATFORMS: [&str; 1] = [scaleway::PLATFORM];

/// Exit status for configuration and other operational faults.
const OPERATIONAL_FAILURE: i32 = 2;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(
        "unknown platform '{0}': supported platforms are {known}",
        known = KNOWN_PLATFORMS.join(", ")
    )]
    UnknownPlatform(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            OPERATIONAL_FAILURE
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let mut registry = Registry::new();
    suites::register_all(&mut registry)?;
    match cli {
        Cli::Run(args) => run_tests(&registry, args).await,
        Cli::List(args) => {
            list_tests(&registry, &args, io::stdout().lock())?;
            Ok(0)
        }
    }
}

async fn run_tests(registry: &Registry, args: RunCommand) -> Result<i32, CliError> {
    if let Some(platform) = &args.platform {
        ensure_known(platform)?;
    }
    let harness = load_harness(&args)?;
    ensure_known(&harness.platform)?;

    let selection = Selection {
        names: args.names,
        pattern: args.pattern,
        include_manual: args.include_manual,
    };
    let plan = selection.plan(registry, &harness.platform)?;
    let factory = scaleway_factory(&harness)?;

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());
    let report = TestRunner::new(factory)
        .with_parallelism(harness.parallel)
        .with_test_timeout(harness.test_timeout())
        .with_cancellation(cancel)
        .run(plan)
        .await;

    report.render(io::stdout().lock())?;
    Ok(report.exit_code())
}

fn ensure_known(platform: &str) -> Result<(), CliError> {
    if KNOWN_PLATFORMS.contains(&platform) {
        Ok(())
    } else {
        Err(CliError::UnknownPlatform(platform.to_owned()))
    }
}

/// Loads runner settings and applies command-line overrides on top.
fn load_harness(args: &RunCommand) -> Result<HarnessConfig, CliError> {
    let mut harness = HarnessConfig::load_without_cli_args()
        .map_err(|err| CliError::Config(err.to_string()))?;
    apply_overrides(&mut harness, args);
    harness
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    Ok(harness)
}

fn apply_overrides(harness: &mut HarnessConfig, args: &RunCommand) {
    if let Some(platform) = &args.platform {
        harness.platform.clone_from(platform);
    }
    if let Some(parallel) = args.parallel {
        harness.parallel = parallel;
    }
    if let Some(timeout) = args.timeout {
        harness.test_timeout_secs = timeout;
    }
}

fn scaleway_factory(harness: &HarnessConfig) -> Result<Arc<dyn ClusterFactory>, CliError> {
    let scaleway_config =
        ScalewayConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let backend =
        ScalewayBackend::new(scaleway_config).map_err(|err| CliError::Backend(err.to_string()))?;
    let ssh = SshConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    ssh.validate()
        .map_err(|err| CliError::Config(err.to_string()))?;

    Ok(Arc::new(
        BackendClusterFactory::new(scaleway::PLATFORM, backend, ProcessCommandRunner, ssh)
            .with_options(harness.cluster_options())
            .with_discovery(DiscoveryClient::new(harness.discovery_url.clone())),
    ))
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; aborting tests and tearing down clusters");
            cancel.cancel();
        }
    });
}

fn list_tests(registry: &Registry, args: &ListCommand, mut out: impl Write) -> io::Result<()> {
    let tests = match &args.platform {
        Some(platform) => registry.for_platform(platform, true),
        None => registry.list().iter().collect(),
    };
    for test in tests {
        let platforms = if test.platforms().is_empty() {
            String::from("all")
        } else {
            test.platforms().join(",")
        };
        let manual = if test.is_manual() { "manual" } else { "" };
        let line = format!(
            "{:<28} {:>2}  {platforms:<10} {manual}",
            test.name(),
            test.cluster_size()
        );
        writeln!(out, "{}", line.trim_end())?;
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn registry() -> Registry {
        let mut registry = Registry::new();
        suites::register_all(&mut registry).expect("built-ins register");
        registry
    }

    fn run_args() -> RunCommand {
        RunCommand {
            platform: None,
            parallel: None,
            timeout: None,
            pattern: None,
            include_manual: false,
            names: Vec::new(),
        }
    }

    fn listing(registry: &Registry, platform: Option<&str>) -> String {
        let mut buf = Vec::new();
        let args = ListCommand {
            platform: platform.map(str::to_owned),
        };
        list_tests(registry, &args, &mut buf).expect("list renders");
        String::from_utf8(buf).expect("utf8")
    }

    #[rstest]
    fn list_shows_every_test_with_constraints(registry: Registry) {
        let rendered = listing(&registry, None);

        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 4, "{rendered}");
        assert!(
            lines
                .iter()
                .any(|l| l.starts_with("cloud.metadata.scaleway") && l.contains("scaleway")),
            "{rendered}"
        );
        assert!(
            lines
                .iter()
                .any(|l| l.starts_with("cluster.discovery") && l.ends_with("manual")),
            "{rendered}"
        );
    }

    #[rstest]
    fn list_filters_by_platform(registry: Registry) {
        let rendered = listing(&registry, Some("fake"));

        assert!(!rendered.contains("cloud.metadata.scaleway"), "{rendered}");
        assert!(rendered.contains("linux.nfs"), "{rendered}");
    }

    #[test]
    fn unknown_platform_is_rejected() {
        let err = ensure_known("openstack").expect_err("not supported");

        assert_eq!(
            err.to_string(),
            "unknown platform 'openstack': supported platforms are scaleway"
        );
        assert!(ensure_known("scaleway").is_ok());
    }

    #[test]
    fn command_line_overrides_configuration() {
        let mut harness = HarnessConfig {
            platform: String::from("scaleway"),
            parallel: 1,
            test_timeout_secs: 1800,
            provision_timeout_secs: 600,
            ssh_retry_attempts: 20,
            ssh_retry_delay_secs: 10,
            discovery_url: String::from("https://discovery.etcd.io"),
        };
        let args = RunCommand {
            platform: Some(String::from("elsewhere")),
            parallel: Some(4),
            timeout: Some(90),
            ..run_args()
        };

        apply_overrides(&mut harness, &args);

        assert_eq!(harness.platform, "elsewhere");
        assert_eq!(harness.parallel, 4);
        assert_eq!(harness.test_timeout_secs, 90);
        assert_eq!(harness.provision_timeout_secs, 600);
    }

    #[rstest]
    #[tokio::test]
    async fn run_with_unknown_platform_fails_before_provisioning(registry: Registry) {
        let args = RunCommand {
            platform: Some(String::from("nowhere")),
            ..run_args()
        };

        let err = run_tests(&registry, args)
            .await
            .expect_err("unknown platform");

        assert!(matches!(err, CliError::UnknownPlatform(ref name) if name == "nowhere"));
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        let err = CliError::Config(String::from("missing secret key"));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert_eq!(rendered, "configuration error: missing secret key\n");
    }
}
