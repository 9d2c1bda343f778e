//! Instance creation helpers for the Scaleway backend.
//!
//! Scaleway instances must receive cloud-init user-data before first boot.
//! The creation request sets `stopped: true` so the payload is available when
//! the instance is powered on.

use serde::Serialize;

use crate::backend::InstanceRequest;
use crate::scaleway::types::{ServerAction, Zone};

use super::super::{ScalewayBackend, ScalewayBackendError};
use super::{InstanceSnapshot, ServerEnvelope};

const INSTANCE_TAGS: [&str; 2] = ["flotilla", "ephemeral"];

#[derive(Serialize)]
struct CreateServerRequest<'a> {
    name: &'a str,
    commercial_type: &'a str,
    image: &'a str,
    project: &'a str,
    routed_ip_enabled: bool,
    dynamic_ip_required: bool,
    tags: Vec<String>,
    stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    cloud_init: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<&'a str>,
}

impl ScalewayBackend {
    pub(in crate::scaleway) async fn power_on_if_needed(
        &self,
        zone: &Zone,
        snapshot: &InstanceSnapshot,
    ) -> Result<(), ScalewayBackendError> {
        if snapshot.is_running() {
            return Ok(());
        }

        if snapshot.allows(&ServerAction::PowerOn) {
            self.api
                .perform_instance_action_async(
                    zone.as_str(),
                    snapshot.id.as_str(),
                    ServerAction::PowerOn.as_str(),
                )
                .await?;
            return Ok(());
        }

        Err(ScalewayBackendError::PowerOnNotAllowed {
            instance_id: snapshot.id.as_str().to_owned(),
            state: snapshot.state.to_string(),
        })
    }

    /// Creates a Scaleway instance in a stopped state, passing the request's
    /// boot configuration as cloud-init user-data.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError`] when the Scaleway API request fails or
    /// the provider rejects the configured instance type.
    pub(in crate::scaleway) async fn create_instance_stopped(
        &self,
        request: &InstanceRequest,
        image_id: &str,
    ) -> Result<InstanceSnapshot, ScalewayBackendError> {
        let url = format!("{}/zones/{}/servers", self.api_base, self.config.default_zone);
        let payload = CreateServerRequest {
            name: &request.name,
            commercial_type: &self.config.default_instance_type,
            image: image_id,
            project: &self.config.default_project_id,
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            tags: INSTANCE_TAGS.iter().map(|tag| (*tag).to_owned()).collect(),
            stopped: true,
            cloud_init: request.boot_config.as_deref(),
            organization: self.config.default_organization_id.as_deref(),
        };

        let response = super::HTTP_CLIENT
            .post(&url)
            .header("X-Auth-Token", &self.config.secret_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if status.is_success() {
            let parsed: ServerEnvelope = serde_json::from_slice(&body)?;
            return Ok(parsed.server.into());
        }

        if let Ok(api_err) = serde_json::from_slice::<scaleway_rs::ScalewayApiError>(&body)
            && self.is_instance_type_error(&api_err)
        {
            return Err(ScalewayBackendError::InstanceTypeUnavailable {
                instance_type: self.config.default_instance_type.clone(),
                zone: self.config.default_zone.clone(),
            });
        }

        Err(ScalewayBackendError::http(status, &body))
    }
}
