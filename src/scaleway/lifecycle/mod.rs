//! Instance lifecycle helpers for the Scaleway backend.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use serde::Deserialize;

mod create;
mod image;
mod wait;

use crate::scaleway::types::{InstanceId, ServerAction, ServerState};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";

pub(crate) static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Subset of the Instances API server object the backend relies on.
#[derive(Debug, Deserialize)]
struct ServerView {
    id: String,
    state: String,
    #[serde(default)]
    allowed_actions: Vec<String>,
    #[serde(default)]
    public_ip: Option<PublicIpView>,
    #[serde(default)]
    private_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PublicIpView {
    address: String,
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: ServerView,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSnapshot {
    pub(crate) id: InstanceId,
    pub(crate) state: ServerState,
    pub(crate) allowed_actions: Vec<ServerAction>,
    pub(crate) public_ip: Option<String>,
    pub(crate) private_ip: Option<String>,
}

impl InstanceSnapshot {
    pub(crate) fn is_running(&self) -> bool {
        self.state == ServerState::Running
    }

    pub(crate) fn allows(&self, action: &ServerAction) -> bool {
        self.allowed_actions.contains(action)
    }

    pub(crate) fn public_address(&self) -> Option<IpAddr> {
        self.public_ip
            .as_deref()
            .and_then(|ip| IpAddr::from_str(ip).ok())
    }

    pub(crate) fn private_address(&self) -> Option<IpAddr> {
        self.private_ip
            .as_deref()
            .and_then(|ip| IpAddr::from_str(ip).ok())
    }
}

impl From<ServerView> for InstanceSnapshot {
    fn from(server: ServerView) -> Self {
        Self {
            id: server.id.into(),
            state: ServerState::from(server.state.as_str()),
            allowed_actions: server
                .allowed_actions
                .iter()
                .map(|action| ServerAction::from(action.as_str()))
                .collect(),
            public_ip: server.public_ip.map(|ip| ip.address),
            private_ip: server.private_ip,
        }
    }
}

#[cfg(test)]
mod tests;
