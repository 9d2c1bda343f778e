//! Configuration loading via `ortho-config`.
//!
//! [`HarnessConfig`] carries the runner settings (`FLOTILLA_*`) and
//! [`ScalewayConfig`] the provider credentials and instance defaults
//! (`SCW_*`). SSH settings live in [`crate::ssh::SshConfig`].

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::platform::{ClusterOptions, DEFAULT_DISCOVERY_URL};
use crate::retry::RetryPolicy;

/// Runner settings derived from defaults, configuration files, and
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "FLOTILLA",
    discovery(
        app_name = "flotilla",
        env_var = "FLOTILLA_CONFIG_PATH",
        config_file_name = "flotilla.toml",
        dotfile_name = ".flotilla.toml",
        project_file_name = "flotilla.toml"
    )
)]
pub struct HarnessConfig {
    /// Platform the tests run against.
    #[ortho_config(default = "scaleway".to_owned())]
    pub platform: String,
    /// Maximum number of tests, and therefore clusters, active at once.
    #[ortho_config(default = 1)]
    pub parallel: usize,
    /// Seconds a single test body may run before it is abandoned.
    #[ortho_config(default = 1800)]
    pub test_timeout_secs: u64,
    /// Seconds allowed for provisioning one machine end to end.
    #[ortho_config(default = 600)]
    pub provision_timeout_secs: u64,
    /// SSH readiness check attempts per machine.
    #[ortho_config(default = 20)]
    pub ssh_retry_attempts: u32,
    /// Seconds between SSH readiness check attempts.
    #[ortho_config(default = 10)]
    pub ssh_retry_delay_secs: u64,
    /// Base URL of the cluster discovery service.
    #[ortho_config(default = DEFAULT_DISCOVERY_URL.to_owned())]
    pub discovery_url: String,
}

impl HarnessConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("flotilla")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks that required values are present and budgets are non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for a blank value and
    /// [`ConfigError::Invalid`] for a zero budget.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.platform,
            &FieldMetadata::new("platform", "FLOTILLA_PLATFORM", "platform", "flotilla"),
        )?;
        require_field(
            &self.discovery_url,
            &FieldMetadata::new(
                "discovery service URL",
                "FLOTILLA_DISCOVERY_URL",
                "discovery_url",
                "flotilla",
            ),
        )?;
        for (is_zero, name) in [
            (self.parallel == 0, "parallel"),
            (self.test_timeout_secs == 0, "test_timeout_secs"),
            (self.provision_timeout_secs == 0, "provision_timeout_secs"),
            (self.ssh_retry_attempts == 0, "ssh_retry_attempts"),
        ] {
            if is_zero {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be at least 1: set FLOTILLA_{} or {name} in flotilla.toml",
                    name.to_uppercase()
                )));
            }
        }
        Ok(())
    }

    /// Timeout applied to each test body.
    #[must_use]
    pub const fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    /// Provisioning budgets for clusters built under this configuration.
    #[must_use]
    pub const fn cluster_options(&self) -> ClusterOptions {
        ClusterOptions {
            readiness: RetryPolicy::new(
                self.ssh_retry_attempts,
                Duration::from_secs(self.ssh_retry_delay_secs),
            ),
            provision_timeout: Duration::from_secs(self.provision_timeout_secs),
        }
    }
}

/// Scaleway specific configuration derived from environment variables,
/// configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Access key assigned to the Scaleway application. While not required for
    /// API calls, it is captured to support future audit logging.
    pub access_key: Option<String>,
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used for billing and resource scoping.
    pub default_project_id: String,
    /// Preferred availability zone. Defaults to `fr-par-1`.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Commercial type for new instances. Defaults to `DEV1-S` to minimise
    /// cost during integration tests.
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub default_instance_type: String,
    /// Human-friendly image label (for example `Ubuntu 24.04 Noble Numbat`).
    #[ortho_config(default = "Ubuntu 24.04 Noble Numbat".to_owned())]
    pub default_image: String,
    /// CPU architecture used to select the correct image variant.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in flotilla.toml",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("flotilla")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.secret_key,
            &FieldMetadata::new(
                "Scaleway API secret key",
                "SCW_SECRET_KEY",
                "secret_key",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_project_id,
            &FieldMetadata::new(
                "Scaleway project ID",
                "SCW_DEFAULT_PROJECT_ID",
                "default_project_id",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_image,
            &FieldMetadata::new("VM image", "SCW_DEFAULT_IMAGE", "default_image", "scaleway"),
        )?;
        require_field(
            &self.default_instance_type,
            &FieldMetadata::new(
                "instance type",
                "SCW_DEFAULT_INSTANCE_TYPE",
                "default_instance_type",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_zone,
            &FieldMetadata::new(
                "availability zone",
                "SCW_DEFAULT_ZONE",
                "default_zone",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_architecture,
            &FieldMetadata::new(
                "CPU architecture",
                "SCW_DEFAULT_ARCHITECTURE",
                "default_architecture",
                "scaleway",
            ),
        )?;
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value is present but out of range.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
