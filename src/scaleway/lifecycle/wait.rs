//! Readiness and teardown wait helpers for the Scaleway backend.

use tokio::time::{Instant, sleep};

use crate::backend::{InstanceHandle, InstanceNetworking};
use crate::scaleway::types::ServerAction;

use super::super::{ScalewayBackend, ScalewayBackendError};
use super::{InstanceSnapshot, ServerEnvelope};

impl ScalewayBackend {
    /// Fetches the current server state, or `None` once the server is gone.
    pub(in crate::scaleway) async fn fetch_instance(
        &self,
        handle: &InstanceHandle,
    ) -> Result<Option<InstanceSnapshot>, ScalewayBackendError> {
        let url = format!("{}/zones/{}/servers/{}", self.api_base, handle.zone, handle.id);
        let response = super::HTTP_CLIENT
            .get(&url)
            .header("X-Auth-Token", &self.config.secret_key)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(ScalewayBackendError::http(status, &body));
        }

        let parsed: ServerEnvelope = serde_json::from_slice(&body)?;
        Ok(Some(parsed.server.into()))
    }

    pub(in crate::scaleway) async fn wait_for_public_ip(
        &self,
        handle: &InstanceHandle,
    ) -> Result<InstanceNetworking, ScalewayBackendError> {
        let deadline = Instant::now() + self.wait_timeout;
        let mut saw_running = false;

        while Instant::now() <= deadline {
            let Some(server) = self.fetch_instance(handle).await? else {
                sleep(self.poll_interval).await;
                continue;
            };

            if !server.is_running() {
                sleep(self.poll_interval).await;
                continue;
            }

            saw_running = true;

            if let Some(address) = server.public_address() {
                return Ok(InstanceNetworking {
                    public_ip: address,
                    private_ip: server.private_address(),
                });
            }

            sleep(self.poll_interval).await;
        }

        if saw_running {
            return Err(ScalewayBackendError::MissingPublicIp {
                instance_id: handle.id.clone(),
            });
        }

        Err(ScalewayBackendError::Timeout {
            action: "wait_for_ready".to_owned(),
            instance_id: handle.id.clone(),
        })
    }

    /// Removes the server and its local volumes. A running server is
    /// terminated; a stopped one is deleted directly.
    pub(in crate::scaleway) async fn remove_instance(
        &self,
        handle: &InstanceHandle,
    ) -> Result<(), ScalewayBackendError> {
        let Some(server) = self.fetch_instance(handle).await? else {
            tracing::debug!(instance = %handle.id, "instance already gone");
            return Ok(());
        };

        if server.allows(&ServerAction::Terminate) {
            self.api
                .perform_instance_action_async(
                    &handle.zone,
                    &handle.id,
                    ServerAction::Terminate.as_str(),
                )
                .await?;
        } else {
            self.api.delete_instance_async(&handle.zone, &handle.id).await?;
        }
        self.wait_until_gone(handle).await
    }

    pub(in crate::scaleway) async fn wait_until_gone(
        &self,
        handle: &InstanceHandle,
    ) -> Result<(), ScalewayBackendError> {
        let deadline = Instant::now() + self.wait_timeout;
        while Instant::now() <= deadline {
            if self.fetch_instance(handle).await?.is_none() {
                return Ok(());
            }
            sleep(self.poll_interval).await;
        }

        Err(ScalewayBackendError::ResidualResource {
            instance_id: handle.id.clone(),
        })
    }
}
