//! Error types for the Scaleway backend.

use crate::backend::BackendError;
use crate::config::ConfigError;
use scaleway_rs::ScalewayError;
use thiserror::Error;

/// Errors raised by the Scaleway backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayBackendError {
    /// Raised when `SCW_*` settings are incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when an instance request is malformed.
    #[error("invalid instance request: {0}")]
    Validation(String),
    /// Raised when no available image matches the configured label.
    #[error("image '{label}' (arch {arch}) not found in zone {zone}")]
    ImageNotFound {
        /// Configured image label.
        label: String,
        /// Configured architecture.
        arch: String,
        /// Zone searched.
        zone: String,
    },
    /// Raised when the zone does not offer the configured commercial type.
    #[error("instance type '{instance_type}' not available in zone {zone}")]
    InstanceTypeUnavailable {
        /// Configured commercial type.
        instance_type: String,
        /// Zone the server was requested in.
        zone: String,
    },
    /// Raised when a server does not reach the awaited state in time.
    #[error("timeout waiting for {action} on instance {instance_id}")]
    Timeout {
        /// State transition being awaited.
        action: String,
        /// Server identifier.
        instance_id: String,
    },
    /// Raised when a running server reports no usable public address.
    #[error("instance {instance_id} missing public IPv4 address")]
    MissingPublicIp {
        /// Server identifier.
        instance_id: String,
    },
    /// Raised when a server is still listed after teardown.
    #[error("instance {instance_id} still present after teardown")]
    ResidualResource {
        /// Server identifier.
        instance_id: String,
    },
    /// Raised when a stopped server does not offer the `poweron` action.
    #[error("instance {instance_id} in state {state} cannot be powered on")]
    PowerOnNotAllowed {
        /// Server identifier.
        instance_id: String,
        /// State reported by the API.
        state: String,
    },
    /// Raised when the Instances API answers with a non-success status.
    #[error("instances API returned {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body, lossily decoded.
        body: String,
    },
    /// Raised when a request cannot be sent or its response cannot be read.
    #[error("instances API request failed: {0}")]
    Transport(String),
    /// Raised when a response body is not the expected JSON.
    #[error("unexpected instances API response: {0}")]
    Decode(String),
    /// Raised by the `scaleway-rs` SDK.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the SDK.
        message: String,
    },
}

impl ScalewayBackendError {
    pub(crate) fn http(status: reqwest::StatusCode, body: &[u8]) -> Self {
        Self::Http {
            status: status.as_u16(),
            body: String::from_utf8_lossy(body).into_owned(),
        }
    }
}

impl From<reqwest::Error> for ScalewayBackendError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

impl From<serde_json::Error> for ScalewayBackendError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

impl From<ScalewayError> for ScalewayBackendError {
    fn from(value: ScalewayError) -> Self {
        Self::Provider {
            message: value.to_string(),
        }
    }
}

impl From<BackendError> for ScalewayBackendError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Validation(field) => Self::Validation(field),
        }
    }
}

impl From<ConfigError> for ScalewayBackendError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
