//! Scaleway backend implementation of the instance lifecycle.

mod error;
mod lifecycle;
mod types;

use std::time::Duration;

use crate::backend::{Backend, BackendFuture, InstanceHandle, InstanceNetworking, InstanceRequest};
use crate::config::ScalewayConfig;
use lifecycle::SCALEWAY_INSTANCE_API_BASE;
use scaleway_rs::ScalewayApi;
use types::Zone;

/// Platform identifier under which the Scaleway backend is registered.
pub const PLATFORM: &str = "scaleway";

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);

pub use error::ScalewayBackendError;

/// Backend that provisions instances through the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayBackend {
    api: ScalewayApi,
    config: ScalewayConfig,
    api_base: String,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl ScalewayBackend {
    fn is_instance_type_error(&self, api_err: &scaleway_rs::ScalewayApiError) -> bool {
        matches!(api_err.resource.as_deref(), Some("commercial_type"))
            || api_err
                .resource_id
                .as_deref()
                .is_some_and(|id| id == self.config.default_instance_type)
            || (api_err.etype == "invalid_arguments"
                && api_err
                    .message
                    .to_ascii_lowercase()
                    .contains("commercial_type"))
    }

    /// Constructs a new backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError::Config`] when the provided configuration
    /// fails validation.
    pub fn new(config: ScalewayConfig) -> Result<Self, ScalewayBackendError> {
        config.validate()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            config,
            api_base: SCALEWAY_INSTANCE_API_BASE.to_owned(),
            poll_interval: POLL_INTERVAL,
            wait_timeout: WAIT_TIMEOUT,
        })
    }

    /// Returns the configuration the backend was built with.
    #[must_use]
    pub const fn config(&self) -> &ScalewayConfig {
        &self.config
    }
}

impl Backend for ScalewayBackend {
    type Error = ScalewayBackendError;

    fn create<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> BackendFuture<'a, InstanceHandle, Self::Error> {
        Box::pin(async move {
            request.validate()?;
            let image_id = self.resolve_image_id().await?;
            let snapshot = self.create_instance_stopped(request, &image_id).await?;
            let handle = InstanceHandle {
                id: snapshot.id.as_str().to_owned(),
                zone: self.config.default_zone.clone(),
            };
            tracing::debug!(instance = %handle.id, name = %request.name, "created stopped instance");

            let zone = Zone::from(handle.zone.as_str());
            if let Err(err) = self.power_on_if_needed(&zone, &snapshot).await {
                if let Err(cleanup) = self.remove_instance(&handle).await {
                    tracing::warn!(
                        instance = %handle.id,
                        error = %cleanup,
                        "failed to remove instance after power-on failure"
                    );
                }
                return Err(err);
            }
            Ok(handle)
        })
    }

    fn wait_for_ready<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, InstanceNetworking, Self::Error> {
        Box::pin(async move { self.wait_for_public_ip(handle).await })
    }

    fn destroy(&self, handle: InstanceHandle) -> BackendFuture<'_, (), Self::Error> {
        Box::pin(async move { self.remove_instance(&handle).await })
    }
}
